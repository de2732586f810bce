//! Merges stored lease metadata with the external liveness feed.
//!
//! The liveness service answers positionally: entry `i` describes address `i`
//! of the request. A reply of the wrong length is treated like any other
//! failed query. Failures never reach the caller; every affected lease falls
//! back to `initializing` inside the grace period and `offline` after it.

use chrono::{DateTime, Utc};
use fleet_common::DisplayStatus;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::StatusCache;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Liveness {
    pub online: bool,
    #[serde(default)]
    pub players: Players,
    #[serde(default)]
    pub map: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Players {
    pub current: u32,
    pub max: u32,
}

/// One lease to reconcile, with its host address already resolved.
#[derive(Debug, Clone)]
pub struct Target {
    pub lease_id: i64,
    pub address: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

/// Live values reported by an online instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInfo {
    pub players: u32,
    pub max_players: u32,
    pub map: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub status: DisplayStatus,
    pub live: Option<LiveInfo>,
}

#[derive(Debug, Error)]
enum QueryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("expected {expected} entries, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Status for one lease. `liveness` is `None` when the feed had nothing usable.
pub fn derive(
    liveness: Option<&Liveness>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> Reconciled {
    if let Some(l) = liveness.filter(|l| l.online) {
        return Reconciled {
            status: DisplayStatus::Online,
            live: Some(LiveInfo {
                players: l.players.current,
                max_players: l.players.max,
                map: l.map.clone(),
            }),
        };
    }
    let status = if now - created_at < grace {
        DisplayStatus::Initializing
    } else {
        DisplayStatus::Offline
    };
    Reconciled { status, live: None }
}

pub struct Reconciler {
    client: reqwest::Client,
    url: String,
    protocol: String,
    grace: chrono::Duration,
    timeout: Duration,
    cache: StatusCache,
}

impl Reconciler {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        protocol: impl Into<String>,
        grace: chrono::Duration,
        timeout: Duration,
        cache: StatusCache,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            protocol: protocol.into(),
            grace,
            timeout,
            cache,
        }
    }

    pub fn grace(&self) -> chrono::Duration {
        self.grace
    }

    fn token(&self, target: &Target) -> String {
        format!("{}:{}:{}", self.protocol, target.address, target.port)
    }

    pub async fn reconcile(&self, targets: &[Target], now: DateTime<Utc>) -> HashMap<i64, Reconciled> {
        let tokens: Vec<String> = targets.iter().map(|t| self.token(t)).collect();

        let mut known: HashMap<i64, Liveness> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for (target, token) in targets.iter().zip(&tokens) {
            match self.cache.get(target.lease_id, token, now) {
                Some(liveness) => {
                    known.insert(target.lease_id, liveness);
                }
                None if !missing.contains(token) => missing.push(token.clone()),
                None => {}
            }
        }

        if !missing.is_empty() {
            match self.query(&missing).await {
                Ok(entries) => {
                    let fetched: HashMap<&String, Liveness> = missing.iter().zip(entries).collect();
                    for (target, token) in targets.iter().zip(&tokens) {
                        if known.contains_key(&target.lease_id) {
                            continue;
                        }
                        if let Some(liveness) = fetched.get(token) {
                            self.cache.insert(target.lease_id, token.clone(), liveness.clone(), now);
                            known.insert(target.lease_id, liveness.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, addresses = missing.len(), "Liveness query failed, falling back to stored state");
                }
            }
        }

        targets
            .iter()
            .map(|target| {
                let status = derive(known.get(&target.lease_id), target.created_at, now, self.grace);
                (target.lease_id, status)
            })
            .collect()
    }

    async fn query(&self, addresses: &[String]) -> Result<Vec<Liveness>, QueryError> {
        debug!(count = addresses.len(), "Querying liveness service");
        let entries: Vec<Liveness> = self
            .client
            .get(&self.url)
            .query(&[("addresses", addresses.join(","))])
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if entries.len() != addresses.len() {
            return Err(QueryError::LengthMismatch {
                expected: addresses.len(),
                actual: entries.len(),
            });
        }
        Ok(entries)
    }
}
