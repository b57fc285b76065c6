//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env as FigmentEnv, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::AiosConfig;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid workers: {0}. Must be between 1 and 64")]
    InvalidWorkers(usize),

    #[error("Data directory cannot be empty")]
    EmptyDataDir,

    #[error("Invalid heartbeat interval: {0}s. Must be at least 1")]
    InvalidHeartbeatInterval(u64),

    #[error("Invalid breaker threshold: {0}. Cannot be 0")]
    InvalidBreakerThreshold(u32),

    #[error("Invalid bus queue capacity: {0}. Must be at least 8")]
    InvalidQueueCapacity(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid retention: {0} days. Must be at least 1")]
    InvalidRetention(u64),

    #[error(
        "Invalid retry backoff: base {0}ms must not exceed cap {1}ms"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid target success rate: {0}. Must be within (0, 1]")]
    InvalidTargetSuccessRate(f64),
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, lowest to highest precedence:
    /// 1. Programmatic defaults
    /// 2. `.aios/config.yaml` (project config)
    /// 3. `.aios/local.yaml` (local overrides, optional)
    /// 4. `AIOS_*` environment variables
    pub fn load() -> Result<AiosConfig> {
        let config: AiosConfig = Figment::new()
            .merge(Serialized::defaults(AiosConfig::default()))
            .merge(Yaml::file(".aios/config.yaml"))
            .merge(Yaml::file(".aios/local.yaml"))
            .merge(FigmentEnv::prefixed("AIOS_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from a specific file, still honoring env overrides.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<AiosConfig> {
        let config: AiosConfig = Figment::new()
            .merge(Serialized::defaults(AiosConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(FigmentEnv::prefixed("AIOS_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration after loading.
    pub fn validate(config: &AiosConfig) -> Result<(), ConfigError> {
        if config.workers == 0 || config.workers > 64 {
            return Err(ConfigError::InvalidWorkers(config.workers));
        }
        if config.data_dir.trim().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }
        if config.heartbeat.interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval(
                config.heartbeat.interval_secs,
            ));
        }
        if config.breaker.threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold(config.breaker.threshold));
        }
        if config.bus.queue_capacity < 8 {
            return Err(ConfigError::InvalidQueueCapacity(config.bus.queue_capacity));
        }
        if config.store.retention_days == 0 {
            return Err(ConfigError::InvalidRetention(config.store.retention_days));
        }
        if config.retry.base_ms > config.retry.cap_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.base_ms,
                config.retry.cap_ms,
            ));
        }
        if !(0.0..=1.0).contains(&config.improvement.target_success_rate)
            || config.improvement.target_success_rate == 0.0
        {
            return Err(ConfigError::InvalidTargetSuccessRate(
                config.improvement.target_success_rate,
            ));
        }
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Env;

    #[test]
    fn test_defaults_validate() {
        let config = AiosConfig::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.workers, 5);
        assert_eq!(config.heartbeat.interval_secs, 30);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AiosConfig::default();
        config.workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWorkers(0))
        ));

        let mut config = AiosConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = AiosConfig::default();
        config.retry.base_ms = 5000;
        config.retry.cap_ms = 1000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(5000, 1000))
        ));
    }

    #[test]
    fn test_yaml_file_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "env: test\nworkers: 3\nheartbeat:\n  interval_secs: 5\n",
        )
        .unwrap();

        temp_env::with_vars(
            [("AIOS_WORKERS", Some("7")), ("AIOS_ENV", None)],
            || {
                let config = ConfigLoader::load_from_file(&path).unwrap();
                assert_eq!(config.env, Env::Test);
                assert_eq!(config.heartbeat.interval_secs, 5);
                // Env var wins over the file
                assert_eq!(config.workers, 7);
            },
        );
    }
}
