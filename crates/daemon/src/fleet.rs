//! Fleet registry and credential pool.
//!
//! Both are loaded from config at startup and never mutated afterwards.
//! Whether a credential is "in use" is always derived from the lease store.

use std::collections::HashSet;
use std::fmt;

use crate::allocator::{AllocationError, Claim};

#[derive(Clone)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub admin_port: u16,
    pub username: String,
    pub private_key: String,
    pub host_key_fingerprint: Option<String>,
    pub port_start: u16,
    pub port_end: u16,
    pub max_instances: u32,
    pub console_password: Option<String>,
}

impl Host {
    pub fn contains_port(&self, port: u16) -> bool {
        (self.port_start..=self.port_end).contains(&port)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("admin_port", &self.admin_port)
            .field("username", &self.username)
            .field("port_start", &self.port_start)
            .field("port_end", &self.port_end)
            .field("max_instances", &self.max_instances)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Credential {
    pub id: i64,
    pub token: String,
    pub active: bool,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Hosts in registration order.
#[derive(Debug, Clone, Default)]
pub struct FleetRegistry {
    hosts: Vec<Host>,
}

impl FleetRegistry {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, id: i64) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    /// Sum of `max_instances`, bounded by each host's port range size.
    pub fn total_capacity(&self) -> usize {
        self.hosts
            .iter()
            .map(|h| {
                let ports = (h.port_end - h.port_start) as usize + 1;
                ports.min(h.max_instances as usize)
            })
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    pub fn new(mut credentials: Vec<Credential>) -> Self {
        credentials.sort_by_key(|c| c.id);
        Self { credentials }
    }

    /// Lowest-id active credential not referenced by any claim.
    pub fn acquire(&self, claims: &[Claim]) -> Result<&Credential, AllocationError> {
        let in_use: HashSet<i64> = claims.iter().map(|c| c.credential_id).collect();
        self.credentials
            .iter()
            .find(|c| c.active && !in_use.contains(&c.id))
            .ok_or(AllocationError::CredentialExhausted)
    }
}
