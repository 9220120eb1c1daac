//! Configuration for the settlement layer

use crate::scheduler::ScheduleConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Ledger the settlement layer drives
    pub ledger: ledger_core::Config,

    /// Window close schedule
    pub schedule: ScheduleConfig,

    /// Netting options
    pub netting: NettingConfig,

    /// Directory for JSON settlement reports (none = not written)
    pub report_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            ledger: ledger_core::Config::default(),
            schedule: ScheduleConfig::default(),
            netting: NettingConfig::default(),
            report_dir: None,
        }
    }
}

/// Netting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NettingConfig {
    /// Minimum netting ratio (0.0 - 1.0); lower ratios are logged
    pub min_netting_ratio: f64,

    /// Offset reverse bilateral obligations in reports
    pub enable_bilateral_optimization: bool,
}

impl Default for NettingConfig {
    fn default() -> Self {
        Self {
            min_netting_ratio: 0.2,
            enable_bilateral_optimization: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.ledger = config.ledger.with_env_overrides()?;

        if let Ok(times) = std::env::var("SETTLEMENT_WINDOW_TIMES") {
            config.schedule.window_times = times
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }

        if let Ok(dir) = std::env::var("SETTLEMENT_REPORT_DIR") {
            config.report_dir = Some(PathBuf::from(dir));
        }

        if let Ok(auto) = std::env::var("SETTLEMENT_AUTO_CONFIRM") {
            config.schedule.auto_confirm = auto == "1" || auto.eq_ignore_ascii_case("true");
        }

        config.validate()?;
        Ok(config)
    }

    /// Check schedule and netting options
    pub fn validate(&self) -> crate::Result<()> {
        self.schedule.parse_times()?;

        if !(0.0..=1.0).contains(&self.netting.min_netting_ratio) {
            return Err(crate::Error::Config(format!(
                "min_netting_ratio {} outside 0.0 - 1.0",
                self.netting.min_netting_ratio
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_ledger_config() {
        let config: Config = toml::from_str(
            r#"
            [ledger]
            data_dir = "/tmp/ledger"
            settlement_currencies = ["USD"]

            [schedule]
            window_times = ["06:00", "18:00"]
            auto_confirm = true

            [netting]
            enable_bilateral_optimization = false
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.ledger.data_dir, std::path::PathBuf::from("/tmp/ledger"));
        assert_eq!(config.schedule.window_times.len(), 2);
        assert!(config.schedule.auto_confirm);
        assert!(!config.netting.enable_bilateral_optimization);
        assert_eq!(config.netting.min_netting_ratio, 0.2);
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let mut config = Config::default();
        config.schedule.window_times = vec!["25:99".to_string()];
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }
}
