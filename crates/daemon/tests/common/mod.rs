#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_daemon::{
    cache::StatusCache,
    clock::ManualClock,
    fleet::{Credential, CredentialPool, FleetRegistry, Host},
    lobby::{LobbyService, Settings},
    provisioner::{Provisioner, RemoteExecutor, RemoteOutput, SessionError},
    reconciler::Reconciler,
};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{Request, Respond, ResponseTemplate};

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn host(id: i64, port_start: u16, port_end: u16, max_instances: u32) -> Host {
    Host {
        id,
        name: format!("host-{id}"),
        address: format!("10.0.0.{id}"),
        admin_port: 22,
        username: "deploy".into(),
        private_key: String::new(),
        host_key_fingerprint: None,
        port_start,
        port_end,
        max_instances,
        console_password: None,
    }
}

pub fn credential(id: i64) -> Credential {
    Credential {
        id,
        token: format!("token-{id}"),
        active: true,
    }
}

/// Spawn action that always succeeds after `delay`, handing out `inst-N`.
pub struct FakeSpawner {
    pub delay: Duration,
    pub spawned: AtomicUsize,
}

impl FakeSpawner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            spawned: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RemoteExecutor for FakeSpawner {
    async fn execute(&self, _host: &Host, _command: &str, _stdin: &[u8]) -> Result<RemoteOutput, SessionError> {
        tokio::time::sleep(self.delay).await;
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteOutput {
            stdout: format!("inst-{n}\n").into_bytes(),
            stderr: Vec::new(),
            exit_status: Some(0),
        })
    }
}

/// Liveness service stub answering one entry per requested address.
pub struct EveryoneOnline;

impl Respond for EveryoneOnline {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let count = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "addresses")
            .map(|(_, v)| v.split(',').count())
            .unwrap_or(0);
        let entries: Vec<_> = (0..count)
            .map(|_| serde_json::json!({"online": true, "players": {"current": 4, "max": 10}, "map": "de_mirage"}))
            .collect();
        ResponseTemplate::new(200).set_body_json(entries)
    }
}

pub struct Fleet {
    pub hosts: Vec<Host>,
    pub credentials: Vec<Credential>,
}

pub fn service(
    db: Arc<Mutex<Connection>>,
    fleet: Fleet,
    executor: Arc<dyn RemoteExecutor>,
    clock: Arc<ManualClock>,
    status_url: &str,
) -> LobbyService {
    service_with_cache(db, fleet, executor, clock, status_url, Duration::ZERO)
}

pub fn service_with_cache(
    db: Arc<Mutex<Connection>>,
    fleet: Fleet,
    executor: Arc<dyn RemoteExecutor>,
    clock: Arc<ManualClock>,
    status_url: &str,
    cache_ttl: Duration,
) -> LobbyService {
    LobbyService::new(
        db,
        FleetRegistry::new(fleet.hosts),
        CredentialPool::new(fleet.credentials),
        Provisioner::new(executor, "gameserver-spawn", Duration::from_secs(2)),
        Reconciler::new(
            reqwest::Client::new(),
            status_url,
            "csgo",
            chrono::Duration::seconds(60),
            Duration::from_secs(2),
            StatusCache::new(cache_ttl),
        ),
        clock,
        Settings {
            lease_ttl: chrono::Duration::hours(2),
            allocation_attempts: 5,
            max_players: 64,
            administrators: vec!["ops".into()],
            console_timeout: Duration::from_secs(1),
        },
    )
}

/// Serve the router on an ephemeral port and return its base URL.
pub async fn serve(service: LobbyService) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, fleet_daemon::api::router(service)).await.unwrap();
    });
    format!("http://{addr}")
}
