//! Application state shared across handlers.

use crate::store::Database;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Lease TTL; leases past their expiry are reclaimable.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_database_url() -> String {
    "sqlite://tarmac.db?mode=rwc".to_string()
}

fn default_lease_seconds() -> i64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: default_database_url(),
            lease_seconds: default_lease_seconds(),
        }
    }
}

/// Shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub lease_seconds: i64,
}

impl AppState {
    pub fn new(db: Database, lease_seconds: i64) -> Self {
        Self { db, lease_seconds }
    }
}
