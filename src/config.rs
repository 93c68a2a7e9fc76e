//! Configuration loading (spec.md §6 "Configuration").

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegulensConfig {
    pub monitor: MonitorConfig,
    pub messenger: MessengerConfig,
    pub simulator: SimulatorConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    pub monitoring_interval_seconds: u64,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessengerConfig {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub batch_size: usize,
    pub queue_refresh_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorConfig {
    pub max_concurrent_simulations: usize,
    pub simulation_timeout_seconds: u64,
    pub result_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for RegulensConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig { monitoring_interval_seconds: 60, max_consecutive_failures: 5 },
            messenger: MessengerConfig {
                max_retries: 3,
                retry_delay_seconds: 30,
                batch_size: 50,
                queue_refresh_interval_seconds: 5,
            },
            simulator: SimulatorConfig {
                max_concurrent_simulations: 5,
                simulation_timeout_seconds: 3600,
                result_retention_days: 90,
            },
            database: DatabaseConfig { path: "regulens.db".to_string() },
        }
    }
}

impl RegulensConfig {
    /// Layers a YAML file (if present) and `REGULENS_*` environment
    /// variables over the defaults, using the `config` crate's builder.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&RegulensConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("REGULENS").separator("__"),
        );

        let config = builder.build().context("failed to assemble configuration")?;
        config.try_deserialize().context("failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.monitoring_interval_seconds == 0 {
            anyhow::bail!("monitor.monitoring_interval_seconds must be greater than 0");
        }
        if self.messenger.max_retries == 0 {
            anyhow::bail!("messenger.max_retries must be greater than 0");
        }
        if self.simulator.max_concurrent_simulations == 0 {
            anyhow::bail!("simulator.max_concurrent_simulations must be greater than 0");
        }
        if self.database.path.is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_spec() {
        let config = RegulensConfig::default();
        assert_eq!(config.monitor.monitoring_interval_seconds, 60);
        assert_eq!(config.monitor.max_consecutive_failures, 5);
        assert_eq!(config.messenger.max_retries, 3);
        assert_eq!(config.simulator.result_retention_days, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "database:\n  path: \"/tmp/custom.db\"\nmonitor:\n  monitoring_interval_seconds: 120\n  max_consecutive_failures: 5").unwrap();
        let config = RegulensConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.path, "/tmp/custom.db");
        assert_eq!(config.monitor.monitoring_interval_seconds, 120);
        assert_eq!(config.messenger.max_retries, 3);
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = RegulensConfig::default();
        config.monitor.monitoring_interval_seconds = 0;
        assert!(config.validate().is_err());
    }
}
