use clap::{Parser, Subcommand};
use fleet_common::{
    ConsoleRequest, ConsoleResponse, CreateLobbyRequest, CreateLobbyResponse, ErrorBody, LeaseView, LobbyView,
    USER_HEADER,
};
use reqwest::{Client, RequestBuilder, Response};

#[derive(Parser)]
#[command(name = "fleetctl", author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the fleet daemon
    #[arg(long, env = "FLEETCTL_URL", default_value = "http://localhost:3030")]
    url: String,

    /// Identity sent with mutating requests
    #[arg(long, env = "FLEETCTL_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a lobby and start its game server
    Create {
        name: String,
        #[arg(long, default_value = "competitive")]
        mode: String,
        #[arg(long, default_value = "de_dust2")]
        map: String,
        #[arg(long, default_value_t = 10)]
        max_players: u32,
        /// Password players need to join
        #[arg(long)]
        secret: Option<String>,
    },
    /// List active lobbies with live status
    List,
    /// Delete a lobby you own
    Delete { id: i64 },
    /// Run a remote console command on a lobby's server
    Console {
        id: i64,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List active leases (administrators only)
    Leases,
}

struct Api {
    client: Client,
    base: String,
    user: Option<String>,
}

impl Api {
    fn authed(&self, req: RequestBuilder) -> Result<RequestBuilder, Box<dyn std::error::Error>> {
        let user = self.user.as_deref().ok_or("--user (or FLEETCTL_USER) is required for this command")?;
        Ok(req.header(USER_HEADER, user))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }
}

/// Print the daemon's error body and exit non-zero.
async fn fail(action: &str, resp: Response) -> ! {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => {
            eprintln!("Failed to {}: {} ({})", action, body.message, body.code);
            if body.retryable {
                eprintln!("This is temporary, try again shortly.");
            }
        }
        Err(_) => eprintln!("Failed to {}: {}", action, status),
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let api = Api {
        client: Client::new(),
        base: cli.url,
        user: cli.user,
    };

    match cli.command {
        Commands::Create {
            name,
            mode,
            map,
            max_players,
            secret,
        } => {
            let req = CreateLobbyRequest {
                name,
                mode,
                max_players,
                map,
                access_secret: secret,
            };
            let resp = api.authed(api.client.post(api.url("/lobbies")))?.json(&req).send().await?;

            if resp.status().is_success() {
                let created: CreateLobbyResponse = resp.json().await?;
                println!("Created lobby {}", created.id);
                println!("Connect: {}:{}", created.server_address, created.server_port);
                println!("Expires: {}", created.expires_at.to_rfc3339());
            } else {
                fail("create lobby", resp).await;
            }
        }
        Commands::List => {
            let resp = api.client.get(api.url("/lobbies")).send().await?;

            if resp.status().is_success() {
                let lobbies: Vec<LobbyView> = resp.json().await?;
                if lobbies.is_empty() {
                    println!("No active lobbies");
                }
                for l in lobbies {
                    let lock = if l.has_access_secret { " [locked]" } else { "" };
                    println!(
                        "#{} {}{} | {} on {} | {} | {} | {}:{} | by {}",
                        l.id,
                        l.name,
                        lock,
                        l.mode,
                        l.map,
                        l.occupancy(),
                        l.status,
                        l.server_address,
                        l.server_port,
                        l.creator
                    );
                }
            } else {
                fail("list lobbies", resp).await;
            }
        }
        Commands::Delete { id } => {
            let resp = api.authed(api.client.delete(api.url(&format!("/lobbies/{}", id))))?.send().await?;

            if resp.status().is_success() {
                println!("Deleted lobby {}", id);
            } else {
                fail("delete lobby", resp).await;
            }
        }
        Commands::Console { id, command } => {
            let req = ConsoleRequest {
                command: command.join(" "),
            };
            let resp = api
                .authed(api.client.post(api.url(&format!("/lobbies/{}/console", id))))?
                .json(&req)
                .send()
                .await?;

            if resp.status().is_success() {
                let out: ConsoleResponse = resp.json().await?;
                for line in out.lines {
                    println!("{}", line);
                }
            } else {
                fail("run console command", resp).await;
            }
        }
        Commands::Leases => {
            let resp = api.authed(api.client.get(api.url("/leases")))?.send().await?;

            if resp.status().is_success() {
                let leases: Vec<LeaseView> = resp.json().await?;
                println!("Active Leases:");
                for lease in leases {
                    println!(
                        "Lease {}: {}:{} credential {} handle {} by {} until {}",
                        lease.id,
                        lease.host,
                        lease.port,
                        lease.credential_id,
                        lease.instance_handle,
                        lease.creator,
                        lease.expires_at.to_rfc3339()
                    );
                }
            } else {
                fail("list leases", resp).await;
            }
        }
    }

    Ok(())
}
