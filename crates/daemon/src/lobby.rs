use fleet_common::{CreateLobbyRequest, CreateLobbyResponse, LeaseView, LobbyView};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::allocator::{self, AllocationError};
use crate::clock::Clock;
use crate::console::{self, ConsoleError};
use crate::db::{self, ConflictKind, NewLobby, NewReservation, StoreError};
use crate::fleet::{Credential, CredentialPool, FleetRegistry, Host};
use crate::provisioner::{Provisioner, SpawnOptions};
use crate::reconciler::{self, Reconciler, Target};

const MAX_NAME_LEN: usize = 64;
const MAX_TOKEN_LEN: usize = 32;
const MAX_SECRET_LEN: usize = 64;
const MAX_COMMAND_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("creator already has an active lobby")]
    Conflict,

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Details are logged; callers only learn that provisioning failed.
    #[error("provisioning failed")]
    Provision,

    #[error("lobby not found")]
    NotFound,

    #[error("not the owner of this lobby")]
    Forbidden,

    #[error("no console configured for this host")]
    ConsoleUnavailable,

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for LobbyError {
    fn from(e: rusqlite::Error) -> Self {
        LobbyError::Store(StoreError::Sqlite(e))
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub lease_ttl: chrono::Duration,
    pub allocation_attempts: u32,
    pub max_players: u32,
    pub administrators: Vec<String>,
    pub console_timeout: Duration,
}

/// Resources held by an `initializing` lease while its spawn is in flight.
#[derive(Debug, Clone)]
struct Reservation {
    lease_id: i64,
    host: Host,
    port: u16,
    credential: Credential,
}

#[derive(Clone)]
pub struct LobbyService {
    db: Arc<Mutex<Connection>>,
    registry: Arc<FleetRegistry>,
    credentials: Arc<CredentialPool>,
    provisioner: Provisioner,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
}

impl LobbyService {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        registry: FleetRegistry,
        credentials: CredentialPool,
        provisioner: Provisioner,
        reconciler: Reconciler,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            registry: Arc::new(registry),
            credentials: Arc::new(credentials),
            provisioner,
            reconciler: Arc::new(reconciler),
            clock,
            settings: Arc::new(settings),
        }
    }

    fn lock_db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_admin(&self, requester: &str) -> bool {
        self.settings.administrators.iter().any(|a| a == requester)
    }

    #[instrument(skip(self, request))]
    pub async fn create(&self, creator: &str, request: CreateLobbyRequest) -> Result<CreateLobbyResponse, LobbyError> {
        let lobby = validate(&request, self.settings.max_players)?;
        let reservation = self.reserve(creator)?;

        let opts = SpawnOptions {
            access_secret: lobby.access_secret.clone(),
            mode: lobby.mode.clone(),
            map: lobby.map.clone(),
            administrators: self.settings.administrators.clone(),
        };

        // Detached so a caller hanging up cannot cancel a spawn half way.
        let this = self.clone();
        tokio::spawn(async move { this.provision(reservation, opts, lobby).await })
            .await
            .map_err(|e| LobbyError::Internal(format!("provisioning task failed: {e}")))?
    }

    fn reserve(&self, creator: &str) -> Result<Reservation, LobbyError> {
        let mut conn = self.lock_db();
        let now = self.clock.now();

        if db::creator_has_live_lease(&conn, creator, now)? {
            debug!("Creator already holds a live lobby");
            return Err(LobbyError::Conflict);
        }

        for attempt in 1..=self.settings.allocation_attempts {
            let claims = db::claims(&conn, now)?;
            let (host, port) = match allocator::allocate(&self.registry, &claims) {
                Ok(found) => found,
                Err(e) => {
                    info!(claims = claims.len(), "Fleet capacity exhausted");
                    return Err(e.into());
                }
            };
            let credential = match self.credentials.acquire(&claims) {
                Ok(c) => c,
                Err(e) => {
                    warn!(claims = claims.len(), "Credential pool exhausted");
                    return Err(e.into());
                }
            };

            let reservation = NewReservation {
                host_id: host.id,
                port,
                credential_id: credential.id,
                creator: creator.to_string(),
                created_at: now,
                expires_at: now + self.settings.lease_ttl,
            };
            match db::reserve(&mut conn, &reservation, host.max_instances, now) {
                Ok(lease_id) => {
                    debug!(lease_id, host = %host.name, port, credential_id = credential.id, "Resources reserved");
                    return Ok(Reservation {
                        lease_id,
                        host: host.clone(),
                        port,
                        credential: credential.clone(),
                    });
                }
                Err(StoreError::Conflict(ConflictKind::Creator)) => return Err(LobbyError::Conflict),
                Err(StoreError::Conflict(kind)) => {
                    debug!(attempt, conflict = %kind, "Reservation rejected by store, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(attempts = self.settings.allocation_attempts, "Allocation kept colliding, reporting capacity exhausted");
        Err(AllocationError::CapacityExhausted.into())
    }

    async fn provision(
        &self,
        r: Reservation,
        opts: SpawnOptions,
        lobby: NewLobby,
    ) -> Result<CreateLobbyResponse, LobbyError> {
        let spawned = self
            .provisioner
            .spawn(&r.host, r.port, &r.credential, r.lease_id, &opts)
            .await;

        let mut conn = self.lock_db();
        match spawned {
            Ok(handle) => match db::activate(&mut conn, r.lease_id, &handle, &lobby) {
                Ok(record) => {
                    info!(lobby_id = record.id, lease_id = r.lease_id, host = %r.host.name, port = r.port, "Lobby created");
                    Ok(CreateLobbyResponse {
                        id: record.id,
                        server_address: r.host.address.clone(),
                        server_port: r.port,
                        expires_at: record.expires_at,
                    })
                }
                Err(e) => {
                    error!(
                        lease_id = r.lease_id,
                        host = %r.host.name,
                        port = r.port,
                        credential_id = r.credential.id,
                        handle = %handle,
                        error = %e,
                        "Dangling instance: spawned but lease could not be activated"
                    );
                    if let Err(e) = db::mark_failed(&conn, r.lease_id) {
                        error!(lease_id = r.lease_id, error = %e, "Failed to quarantine lease");
                    }
                    Err(LobbyError::Provision)
                }
            },
            Err(e) if e.is_ambiguous() => {
                error!(
                    lease_id = r.lease_id,
                    host = %r.host.name,
                    port = r.port,
                    credential_id = r.credential.id,
                    error = %e,
                    "Dangling instance: spawn outcome unknown, lease quarantined for manual reconciliation"
                );
                if let Err(e) = db::mark_failed(&conn, r.lease_id) {
                    error!(lease_id = r.lease_id, error = %e, "Failed to quarantine lease");
                }
                Err(LobbyError::Provision)
            }
            Err(e) => {
                error!(
                    lease_id = r.lease_id,
                    host = %r.host.name,
                    port = r.port,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Provisioning failed"
                );
                if let Err(e) = db::discard(&conn, r.lease_id) {
                    error!(lease_id = r.lease_id, error = %e, "Failed to discard reservation");
                }
                Err(LobbyError::Provision)
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<LobbyView>, LobbyError> {
        let now = self.clock.now();
        let rows = {
            let conn = self.lock_db();
            db::list_active_lobbies(&conn, now)?
        };

        let targets: Vec<Target> = rows
            .iter()
            .filter_map(|row| {
                let host = self.registry.get(row.lease.host_id)?;
                Some(Target {
                    lease_id: row.lease.id,
                    address: host.address.clone(),
                    port: row.lease.port,
                    created_at: row.lease.created_at,
                })
            })
            .collect();
        let statuses = self.reconciler.reconcile(&targets, now).await;

        let views = rows
            .into_iter()
            .map(|row| {
                let reconciled = statuses.get(&row.lease.id).cloned().unwrap_or_else(|| {
                    reconciler::derive(None, row.lease.created_at, now, self.reconciler.grace())
                });
                let server_address = self
                    .registry
                    .get(row.lease.host_id)
                    .map(|h| h.address.clone())
                    .unwrap_or_default();
                let (map, max_players, players) = match reconciled.live {
                    Some(live) => (live.map, live.max_players, Some(live.players)),
                    None => (row.lobby.map, row.lobby.max_players, None),
                };
                LobbyView {
                    id: row.lobby.id,
                    name: row.lobby.name,
                    mode: row.lobby.mode,
                    map,
                    max_players,
                    players,
                    has_access_secret: row.lobby.access_secret.is_some(),
                    creator: row.lobby.creator,
                    server_address,
                    server_port: row.lease.port,
                    status: reconciled.status,
                    created_at: row.lobby.created_at,
                    expires_at: row.lobby.expires_at,
                }
            })
            .collect();
        Ok(views)
    }

    /// Active leases with their instance handles, for operators.
    pub fn active_leases(&self, requester: &str) -> Result<Vec<LeaseView>, LobbyError> {
        if !self.is_admin(requester) {
            return Err(LobbyError::Forbidden);
        }
        let conn = self.lock_db();
        let leases = db::list_active(&conn, self.clock.now())?;
        Ok(leases
            .into_iter()
            .map(|l| LeaseView {
                id: l.id,
                host: self
                    .registry
                    .get(l.host_id)
                    .map(|h| h.name.clone())
                    .unwrap_or_else(|| l.host_id.to_string()),
                port: l.port,
                credential_id: l.credential_id,
                instance_handle: l.instance_handle.unwrap_or_default(),
                creator: l.creator,
                created_at: l.created_at,
                expires_at: l.expires_at,
            })
            .collect())
    }

    /// Look up a non-expired lobby the requester may manage.
    fn owned_lobby(&self, conn: &Connection, lobby_id: i64, requester: &str) -> Result<db::LobbyWithLease, LobbyError> {
        let row = db::get_lobby(conn, lobby_id)?
            .filter(|row| !row.lease.is_expired(self.clock.now()))
            .ok_or(LobbyError::NotFound)?;
        if row.lobby.creator != requester && !self.is_admin(requester) {
            return Err(LobbyError::Forbidden);
        }
        Ok(row)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, lobby_id: i64, requester: &str) -> Result<(), LobbyError> {
        let mut conn = self.lock_db();
        let row = self.owned_lobby(&conn, lobby_id, requester)?;
        db::delete_lobby(&mut conn, lobby_id)?;
        info!(lease_id = row.lease.id, host_id = row.lease.host_id, port = row.lease.port, "Lobby deleted, lease released");
        Ok(())
    }

    pub async fn console(&self, lobby_id: i64, requester: &str, command: &str) -> Result<Vec<String>, LobbyError> {
        let command = command.trim();
        if command.is_empty() || command.len() > MAX_COMMAND_LEN {
            return Err(LobbyError::Validation(format!(
                "command must be 1-{MAX_COMMAND_LEN} characters"
            )));
        }

        let (host, port) = {
            let conn = self.lock_db();
            let row = self.owned_lobby(&conn, lobby_id, requester)?;
            let host = self.registry.get(row.lease.host_id).cloned().ok_or(LobbyError::NotFound)?;
            (host, row.lease.port)
        };
        let password = host.console_password.as_deref().ok_or(LobbyError::ConsoleUnavailable)?;

        console::send_command(&host.address, port, password, command, self.settings.console_timeout)
            .await
            .map_err(|e| {
                warn!(lobby_id, host = %host.name, port, error = %e, "Console command failed");
                LobbyError::from(e)
            })
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_TOKEN_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate(request: &CreateLobbyRequest, max_players_limit: u32) -> Result<NewLobby, LobbyError> {
    let name = request.name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(LobbyError::Validation(format!("name must be 1-{MAX_NAME_LEN} characters")));
    }
    if !is_token(&request.mode) {
        return Err(LobbyError::Validation("mode must be 1-32 characters of [A-Za-z0-9_-]".into()));
    }
    if !is_token(&request.map) {
        return Err(LobbyError::Validation("map must be 1-32 characters of [A-Za-z0-9_-]".into()));
    }
    if request.max_players == 0 || request.max_players > max_players_limit {
        return Err(LobbyError::Validation(format!(
            "maxPlayers must be between 1 and {max_players_limit}"
        )));
    }
    let access_secret = match request.access_secret.as_deref() {
        None | Some("") => None,
        Some(secret) => {
            if secret.len() > MAX_SECRET_LEN || !secret.chars().all(|c| c.is_ascii_graphic()) {
                return Err(LobbyError::Validation(
                    "accessSecret must be at most 64 printable characters without spaces".into(),
                ));
            }
            Some(secret.to_string())
        }
    };

    Ok(NewLobby {
        name: name.to_string(),
        mode: request.mode.clone(),
        map: request.map.clone(),
        max_players: request.max_players,
        access_secret,
    })
}
