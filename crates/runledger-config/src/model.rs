use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COLLECTION: &str = "migrations";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level configuration, loaded once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Run `init_and_maybe_run` from `bootstrap`.
    #[serde(default = "default_true")]
    pub auto_run: bool,

    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Identifies this process in `claimed_by`. A random id is used when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            auto_run: true,
            scheduling: SchedulingConfig::default(),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file shared by all cooperating processes. In-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Table holding the migration records.
    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            collection: default_collection(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// When false, the no-op scheduler is used: one-off schedules run
    /// immediately and cron schedules are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
