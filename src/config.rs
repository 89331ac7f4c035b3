//! Configuration for the store, coordinator, registry and fanout.
//!
//! Every struct has a `Default` carrying the production defaults, and
//! deserializes with `#[serde(default)]` so a JSON document only needs the
//! fields it overrides.

use crate::error::{Result, StoreError};
use crate::types::MAX_VALUE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the coordinator does when the idempotency token was already committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Look up the recorded mutation and return its result.
    #[default]
    ReturnRecorded,
    /// Treat it like a version conflict and retry until exhausted.
    Retry,
}

/// Mutation coordinator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Attempts before giving up with `RetriesExhausted`.
    /// Default: 5
    pub max_retries: u32,

    /// Backoff unit; attempt `n` sleeps `base * 2^n`.
    /// Default: 100ms
    pub backoff_base_ms: u64,

    /// Inclusive upper bound of the counter.
    pub max_value: i64,

    pub duplicate_policy: DuplicatePolicy,
}

impl CoordinatorConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 100,
            max_value: MAX_VALUE,
            duplicate_policy: DuplicatePolicy::ReturnRecorded,
        }
    }
}

/// Durable ledger store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory holding the manifest, lock and ledger file.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync after every ledger write.
    pub sync_writes: bool,

    /// Upper bound on waiting for the table lock.
    /// Default: 1000ms
    pub op_timeout_ms: u64,
}

impl LedgerConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./counter-store"),
            create_if_missing: true,
            sync_writes: true,
            op_timeout_ms: 1000,
        }
    }
}

/// Broadcast fanout settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// When false, broadcasts are a no-op even with an endpoint configured.
    pub enabled: bool,

    /// Per-delivery timeout.
    /// Default: 2000ms
    pub delivery_timeout_ms: u64,

    /// Max concurrent deliveries per broadcast.
    pub max_parallel: usize,
}

impl FanoutConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delivery_timeout_ms: 2000,
            max_parallel: 32,
        }
    }
}

/// Connection registry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expiry horizon of a registration.
    /// Default: 1 hour
    pub ttl_secs: u64,

    /// Snapshot file; None keeps the registry in memory only.
    pub path: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            path: None,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub coordinator: CoordinatorConfig,
    pub ledger: LedgerConfig,
    pub fanout: FanoutConfig,
    pub registry: RegistryConfig,
}

impl ServiceConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}
