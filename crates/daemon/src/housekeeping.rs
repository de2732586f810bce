//! Periodic removal of expired lobby and lease rows.
//!
//! Expiry is a read-time predicate everywhere else, so this sweep only keeps
//! the tables small. Allocation is correct with or without it.

use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::clock::Clock;
use crate::db;

pub struct Housekeeper {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Housekeeper {
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { db, clock, interval }
    }

    /// One sweep. Returns the number of lease rows removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut conn = self.db.lock().unwrap_or_else(|e| e.into_inner());
        match db::delete_expired(&mut conn, now) {
            Ok(expired) => {
                if !expired.is_empty() {
                    info!(removed = expired.len(), "Removed expired leases");
                }
                expired.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to remove expired leases");
                0
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting housekeeping");
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Housekeeping shutting down");
                        break;
                    }
                }
            }
        }
    }
}
