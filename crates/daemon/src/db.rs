use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::allocator::Claim;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS leases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL,
    port INTEGER NOT NULL,
    credential_id INTEGER NOT NULL,
    instance_handle TEXT,
    creator TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS leases_host_expiry ON leases (host_id, expires_at_ms);
CREATE INDEX IF NOT EXISTS leases_creator ON leases (creator, expires_at_ms);

CREATE TABLE IF NOT EXISTS lobbies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lease_id INTEGER NOT NULL UNIQUE REFERENCES leases (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    mode TEXT NOT NULL,
    map TEXT NOT NULL,
    max_players INTEGER NOT NULL,
    access_secret TEXT,
    creator TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
"#;

const LEASE_COLUMNS: &str =
    "id, host_id, port, credential_id, instance_handle, creator, created_at_ms, expires_at_ms, status";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("conflicting lease: {0}")]
    Conflict(ConflictKind),

    #[error("lease {0} is not awaiting activation")]
    NotPending(i64),
}

/// Which invariant a rejected reservation would have broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Creator,
    HostPort,
    Credential,
    HostCapacity,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictKind::Creator => "creator already has a live lobby",
            ConflictKind::HostPort => "host port already leased",
            ConflictKind::Credential => "credential already leased",
            ConflictKind::HostCapacity => "host at capacity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Initializing,
    ProvisioningFailed,
    Active,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Initializing => "initializing",
            LeaseStatus::ProvisioningFailed => "provisioning_failed",
            LeaseStatus::Active => "active",
        }
    }
}

impl ToSql for LeaseStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for LeaseStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "initializing" => Ok(LeaseStatus::Initializing),
            "provisioning_failed" => Ok(LeaseStatus::ProvisioningFailed),
            "active" => Ok(LeaseStatus::Active),
            other => Err(FromSqlError::Other(format!("unknown lease status {other:?}").into())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub host_id: i64,
    pub port: u16,
    pub credential_id: i64,
    pub instance_handle: Option<String>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LeaseStatus,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub host_id: i64,
    pub port: u16,
    pub credential_id: i64,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLobby {
    pub name: String,
    pub mode: String,
    pub map: String,
    pub max_players: u32,
    pub access_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Lobby {
    pub id: i64,
    pub lease_id: i64,
    pub name: String,
    pub mode: String,
    pub map: String,
    pub max_players: u32,
    pub access_secret: Option<String>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A lobby joined with the lease backing it.
#[derive(Debug, Clone)]
pub struct LobbyWithLease {
    pub lobby: Lobby,
    pub lease: Lease,
}

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn lease_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Lease> {
    Ok(Lease {
        id: row.get(offset)?,
        host_id: row.get(offset + 1)?,
        port: row.get(offset + 2)?,
        credential_id: row.get(offset + 3)?,
        instance_handle: row.get(offset + 4)?,
        creator: row.get(offset + 5)?,
        created_at: timestamp(row, offset + 6)?,
        expires_at: timestamp(row, offset + 7)?,
        status: row.get(offset + 8)?,
    })
}

fn lobby_from_row(row: &Row<'_>) -> rusqlite::Result<Lobby> {
    Ok(Lobby {
        id: row.get(0)?,
        lease_id: row.get(1)?,
        name: row.get(2)?,
        mode: row.get(3)?,
        map: row.get(4)?,
        max_players: row.get(5)?,
        access_secret: row.get(6)?,
        creator: row.get(7)?,
        created_at: timestamp(row, 8)?,
        expires_at: timestamp(row, 9)?,
    })
}

/// Every non-expired lease row, whatever its status, as allocation claims.
pub fn claims(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<Claim>> {
    let mut stmt = conn.prepare(
        "SELECT host_id, port, credential_id FROM leases WHERE expires_at_ms > ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![millis(now)], |row| {
        Ok(Claim {
            host_id: row.get(0)?,
            port: row.get(1)?,
            credential_id: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Whether the creator holds a live or in-flight lease. Quarantined rows do not count.
pub fn creator_has_live_lease(conn: &Connection, creator: &str, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM leases WHERE creator = ?1 AND expires_at_ms > ?2 AND status IN ('initializing', 'active'))",
        params![creator, millis(now)],
        |row| row.get(0),
    )
}

/// Write an `initializing` lease after re-checking every occupancy rule inside
/// an IMMEDIATE transaction, so a writer working from a stale read is rejected.
pub fn reserve(
    conn: &mut Connection,
    reservation: &NewReservation,
    max_instances: u32,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now_ms = millis(now);

    if creator_has_live_lease(&tx, &reservation.creator, now)? {
        return Err(StoreError::Conflict(ConflictKind::Creator));
    }

    let port_taken: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM leases WHERE host_id = ?1 AND port = ?2 AND expires_at_ms > ?3)",
        params![reservation.host_id, reservation.port, now_ms],
        |row| row.get(0),
    )?;
    if port_taken {
        return Err(StoreError::Conflict(ConflictKind::HostPort));
    }

    let credential_taken: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM leases WHERE credential_id = ?1 AND expires_at_ms > ?2)",
        params![reservation.credential_id, now_ms],
        |row| row.get(0),
    )?;
    if credential_taken {
        return Err(StoreError::Conflict(ConflictKind::Credential));
    }

    let on_host: i64 = tx.query_row(
        "SELECT COUNT(*) FROM leases WHERE host_id = ?1 AND expires_at_ms > ?2",
        params![reservation.host_id, now_ms],
        |row| row.get(0),
    )?;
    if on_host >= i64::from(max_instances) {
        return Err(StoreError::Conflict(ConflictKind::HostCapacity));
    }

    tx.execute(
        "INSERT INTO leases (host_id, port, credential_id, instance_handle, creator, created_at_ms, expires_at_ms, status) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7)",
        params![
            reservation.host_id,
            reservation.port,
            reservation.credential_id,
            reservation.creator,
            millis(reservation.created_at),
            millis(reservation.expires_at),
            LeaseStatus::Initializing,
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

/// Record the instance handle and create the lobby in one transaction.
pub fn activate(
    conn: &mut Connection,
    lease_id: i64,
    instance_handle: &str,
    lobby: &NewLobby,
) -> Result<Lobby, StoreError> {
    let tx = conn.transaction()?;

    let updated = tx.execute(
        "UPDATE leases SET status = ?1, instance_handle = ?2 WHERE id = ?3 AND status = ?4",
        params![LeaseStatus::Active, instance_handle, lease_id, LeaseStatus::Initializing],
    )?;
    if updated == 0 {
        return Err(StoreError::NotPending(lease_id));
    }

    let (creator, created_at_ms, expires_at_ms): (String, i64, i64) = tx.query_row(
        "SELECT creator, created_at_ms, expires_at_ms FROM leases WHERE id = ?1",
        params![lease_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    tx.execute(
        "INSERT INTO lobbies (lease_id, name, mode, map, max_players, access_secret, creator, created_at_ms, expires_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            lease_id,
            lobby.name,
            lobby.mode,
            lobby.map,
            lobby.max_players,
            lobby.access_secret,
            creator,
            created_at_ms,
            expires_at_ms,
        ],
    )?;
    let id = tx.last_insert_rowid();
    let record = tx.query_row(
        "SELECT id, lease_id, name, mode, map, max_players, access_secret, creator, created_at_ms, expires_at_ms FROM lobbies WHERE id = ?1",
        params![id],
        lobby_from_row,
    )?;
    tx.commit()?;
    Ok(record)
}

/// Drop a reservation whose spawn definitely did not start anything.
pub fn discard(conn: &Connection, lease_id: i64) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "DELETE FROM leases WHERE id = ?1 AND status = ?2",
        params![lease_id, LeaseStatus::Initializing],
    )?;
    Ok(rows > 0)
}

/// Quarantine a reservation whose spawn outcome is unknown. The row keeps its
/// port and credential until it expires.
pub fn mark_failed(conn: &Connection, lease_id: i64) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "UPDATE leases SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![LeaseStatus::ProvisioningFailed, lease_id, LeaseStatus::Initializing],
    )?;
    Ok(rows > 0)
}

pub fn get_lease(conn: &Connection, lease_id: i64) -> rusqlite::Result<Option<Lease>> {
    conn.query_row(
        &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = ?1"),
        params![lease_id],
        |row| lease_from_row(row, 0),
    )
    .optional()
}

/// Active, non-expired leases.
pub fn list_active(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<Lease>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LEASE_COLUMNS} FROM leases WHERE status = ?1 AND expires_at_ms > ?2 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![LeaseStatus::Active, millis(now)], |row| lease_from_row(row, 0))?;
    rows.collect()
}

const LOBBY_JOIN: &str = "SELECT b.id, b.lease_id, b.name, b.mode, b.map, b.max_players, b.access_secret, b.creator, b.created_at_ms, b.expires_at_ms, \
     l.id, l.host_id, l.port, l.credential_id, l.instance_handle, l.creator, l.created_at_ms, l.expires_at_ms, l.status \
     FROM lobbies b JOIN leases l ON l.id = b.lease_id";

fn lobby_with_lease(row: &Row<'_>) -> rusqlite::Result<LobbyWithLease> {
    Ok(LobbyWithLease {
        lobby: lobby_from_row(row)?,
        lease: lease_from_row(row, 10)?,
    })
}

pub fn list_active_lobbies(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<LobbyWithLease>> {
    let mut stmt = conn.prepare(&format!("{LOBBY_JOIN} WHERE b.expires_at_ms > ?1 ORDER BY b.id"))?;
    let rows = stmt.query_map(params![millis(now)], lobby_with_lease)?;
    rows.collect()
}

pub fn get_lobby(conn: &Connection, lobby_id: i64) -> rusqlite::Result<Option<LobbyWithLease>> {
    conn.query_row(&format!("{LOBBY_JOIN} WHERE b.id = ?1"), params![lobby_id], lobby_with_lease)
        .optional()
}

/// Delete a lobby together with its lease.
pub fn delete_lobby(conn: &mut Connection, lobby_id: i64) -> rusqlite::Result<bool> {
    let tx = conn.transaction()?;
    let lease_id: Option<i64> = tx
        .query_row("SELECT lease_id FROM lobbies WHERE id = ?1", params![lobby_id], |row| row.get(0))
        .optional()?;
    let Some(lease_id) = lease_id else {
        return Ok(false);
    };
    tx.execute("DELETE FROM lobbies WHERE id = ?1", params![lobby_id])?;
    tx.execute("DELETE FROM leases WHERE id = ?1", params![lease_id])?;
    tx.commit()?;
    Ok(true)
}

/// Delete all expired lobbies and leases, returning the removed lease ids.
pub fn delete_expired(conn: &mut Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<i64>> {
    let tx = conn.transaction()?;
    let now_ms = millis(now);

    let expired: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM leases WHERE expires_at_ms <= ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![now_ms], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    tx.execute("DELETE FROM lobbies WHERE expires_at_ms <= ?1", params![now_ms])?;
    tx.execute("DELETE FROM leases WHERE expires_at_ms <= ?1", params![now_ms])?;
    tx.commit()?;
    Ok(expired)
}
