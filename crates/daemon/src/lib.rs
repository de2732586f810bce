//! Ephemeral game-server fleet daemon.
//!
//! Turns lobby requests into time-bounded game-server instances on a fleet of
//! remote hosts. Host slots, ports and login credentials are allocated from
//! the lease store, instances are started over SSH, and listings are enriched
//! with a live status feed.

pub mod allocator;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod console;
pub mod db;
pub mod fleet;
pub mod housekeeping;
pub mod lobby;
pub mod provisioner;
pub mod reconciler;
pub mod ssh;
