use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::xfer::OutboxConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// PostgreSQL connection URL for the ledger
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub outbox: OutboxSettings,
}

/// Transfer pipeline settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Requests whose original timestamp is older than this are rejected
    pub history_barrier_days: i64,
    /// `user_confirm` transfers wait for the holder instead of completing
    pub user_confirm_required: bool,
    /// Extra attempts after a lost limit-stats race
    pub limit_retries: u32,
    /// Purchases older than this can no longer be refunded
    pub refund_window_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_barrier_days: 30,
            user_confirm_required: true,
            limit_retries: 2,
            refund_window_days: 90,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboxSettings {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    pub batch_size: usize,
    pub max_retries: i32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: 5000,
            batch_size: 100,
            max_retries: 20,
        }
    }
}

impl From<&OutboxSettings> for OutboxConfig {
    fn from(settings: &OutboxSettings) -> Self {
        Self {
            scan_interval: Duration::from_millis(settings.scan_interval_ms),
            batch_size: settings.batch_size,
            max_retries: settings.max_retries,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config yaml")
    }
}
