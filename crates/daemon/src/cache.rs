use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::reconciler::Liveness;

#[derive(Debug)]
struct Entry {
    stored_at: DateTime<Utc>,
    address: String,
    liveness: Liveness,
}

/// Per-lease liveness entries with a bounded lifetime. A zero TTL disables caching.
///
/// Entries are keyed by lease id so a (host, port) handed to a new lease never
/// inherits the previous instance's status. Ages are measured against the
/// caller's `now`.
#[derive(Debug)]
pub struct StatusCache {
    ttl: chrono::Duration,
    entries: Mutex<HashMap<i64, Entry>>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn fresh(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.stored_at < self.ttl
    }

    pub fn get(&self, lease_id: i64, address: &str, now: DateTime<Utc>) -> Option<Liveness> {
        if self.ttl.is_zero() {
            return None;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&lease_id) {
            Some(entry) if entry.address == address && self.fresh(entry, now) => Some(entry.liveness.clone()),
            Some(_) => {
                entries.remove(&lease_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, lease_id: i64, address: String, liveness: Liveness, now: DateTime<Utc>) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| now - entry.stored_at < self.ttl);
        entries.insert(
            lease_id,
            Entry {
                stored_at: now,
                address,
                liveness,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
