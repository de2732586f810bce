use anyhow::Context;
use clap::Parser;
use fleet_daemon::{
    api,
    cache::StatusCache,
    clock::{Clock, SystemClock},
    config::{self, Config},
    db,
    fleet::{CredentialPool, FleetRegistry},
    housekeeping::Housekeeper,
    lobby::{LobbyService, Settings},
    provisioner::Provisioner,
    reconciler::Reconciler,
    ssh::SshExecutor,
};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::{signal, sync::watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Game-server fleet daemon
#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about, long_about = None)]
struct Args {
    /// Path to the TOML config (default: ~/.fleetd/config.toml)
    #[arg(short, long, env = "FLEETD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,russh=warn")))
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;

    let db_path = config.database_path();
    info!(path = %db_path.display(), "Using database");
    let conn = db::init_db(&db_path).context("failed to initialize database")?;

    let registry = FleetRegistry::new(config.hosts()?);
    let credentials = CredentialPool::new(config.credentials());
    if registry.hosts().is_empty() {
        warn!("No hosts configured, every allocation will report capacity exhausted");
    }
    info!(
        hosts = registry.hosts().len(),
        capacity = registry.total_capacity(),
        credentials = config.credentials.len(),
        "Fleet loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(config.timeouts.status())
        .build()
        .context("failed to build HTTP client")?;
    let reconciler = Reconciler::new(
        http,
        config.status_service_url.clone(),
        config.status_protocol.clone(),
        config.timeouts.grace_period(),
        config.timeouts.status(),
        StatusCache::new(config.timeouts.status_cache_ttl()),
    );
    let provisioner = Provisioner::new(
        Arc::new(SshExecutor::new()),
        config.spawn_command.clone(),
        config.timeouts.provision(),
    );

    let db = Arc::new(Mutex::new(conn));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = LobbyService::new(
        db.clone(),
        registry,
        credentials,
        provisioner,
        reconciler,
        clock.clone(),
        Settings {
            lease_ttl: config.timeouts.lease_ttl(),
            allocation_attempts: config.limits.allocation_attempts,
            max_players: config.limits.max_players,
            administrators: config.administrators.clone(),
            console_timeout: config.timeouts.console(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping = config.timeouts.housekeeping_interval().map(|interval| {
        let keeper = Housekeeper::new(db.clone(), clock.clone(), interval);
        keeper.sweep();
        tokio::spawn(keeper.run(shutdown_rx))
    });

    let app = api::router(service);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    if let Some(task) = housekeeping {
        task.await.ok();
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
