//! Configuration for the ledger

use crate::reference::ParticipantConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Amount policy
    pub amount: AmountConfig,

    /// Timeout sweeper configuration
    pub sweeper: SweeperConfig,

    /// Currencies for which an OPEN settlement window is kept
    pub settlement_currencies: Vec<String>,

    /// Static reference data (participants, accounts, caps)
    pub participants: Vec<ParticipantConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            rocksdb: RocksDBConfig::default(),
            amount: AmountConfig::default(),
            sweeper: SweeperConfig::default(),
            settlement_currencies: vec!["USD".to_string()],
            participants: Vec::new(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Row lock wait before a transaction gives up (milliseconds)
    pub lock_timeout_ms: i64,

    /// Retries of a transaction that hit a transient store error
    pub max_retries: u32,

    /// fsync the WAL on every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            lock_timeout_ms: 1_000,
            max_retries: 3,
            sync_writes: false,
            enable_statistics: false,
        }
    }
}

/// Amount scale/precision policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmountConfig {
    /// Maximum fractional digits
    pub scale: u32,

    /// Maximum significant digits
    pub precision: u32,
}

impl Default for AmountConfig {
    fn default() -> Self {
        Self {
            scale: 4,
            precision: 18,
        }
    }
}

/// Timeout sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the sweeper at all
    pub enabled: bool,

    /// Sweep cycle (milliseconds)
    pub interval_ms: u64,

    /// Maximum transfers expired per cycle
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            batch_size: 500,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> crate::Result<Self> {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(interval) = std::env::var("LEDGER_SWEEP_INTERVAL_MS") {
            self.sweeper.interval_ms = interval.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_SWEEP_INTERVAL_MS: {}", e))
            })?;
        }

        if let Ok(addr) = std::env::var("LEDGER_METRICS_ADDR") {
            self.metrics_listen_addr = addr;
        }

        Ok(self)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Config::default().with_env_overrides()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "ledger-core");
        assert_eq!(config.amount.scale, 4);
        assert!(config.sweeper.enabled);
    }

    #[test]
    fn test_parse_toml_with_participants() {
        let config = Config::from_toml(
            r#"
            data_dir = "/tmp/ledger"
            settlement_currencies = ["USD", "EUR"]

            [sweeper]
            interval_ms = 250

            [[participants]]
            name = "dfsp1"
            accounts = [{ currency = "USD", net_debit_cap = "1000" }]

            [[participants]]
            name = "dfsp2"
            active = false
            accounts = [{ currency = "USD", net_debit_cap = "500", active = false }]
            "#,
        )
        .unwrap();

        assert_eq!(config.sweeper.interval_ms, 250);
        assert_eq!(config.sweeper.batch_size, 500);
        assert_eq!(config.settlement_currencies.len(), 2);
        assert_eq!(config.participants.len(), 2);
        assert!(config.participants[0].active);
        assert!(!config.participants[1].accounts[0].active);
    }
}
