use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub lock_timeout_ms: u64,
    pub event_page_size: usize,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::DuckDb {
                path: Some(PathBuf::from("strata.db")),
            },
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            lock_timeout_ms: 30_000,
            event_page_size: 500,
        }
    }
}

impl StrataConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Flat files under `root`, one directory per agent.
    File { root: PathBuf },
    /// Embedded DuckDB file; `None` opens an in-memory database.
    DuckDb { path: Option<PathBuf> },
    Postgres { url: String },
    /// Events and context records on files, structured entities on `structured`.
    Hybrid {
        root: PathBuf,
        structured: Box<BackendConfig>,
    },
}

/// Bounds for the shared connection pool of server-backed stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 600_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
