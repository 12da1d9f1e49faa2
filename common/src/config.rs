// Configuration management with layered configuration (file, env)

use crate::table::RawTaskDefinition;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub redis: RedisConfig,
    pub nats: NatsSettings,
    pub observability: ObservabilityConfig,
    /// Recurring task definitions, keyed by task key
    #[serde(default)]
    pub schedule: BTreeMap<String, RawTaskDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Master switch; when false the table is loaded and validated but the
    /// tick loop never starts
    pub enabled: bool,
    pub tick_interval_seconds: u64,
    /// Within-tick retry budget for a failed enqueue
    pub max_dispatch_attempts: u32,
    pub dedup_backend: DedupBackend,
    pub dedup_record_ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupBackend {
    /// Shared Redis store; required when more than one scheduler instance
    /// runs against the same table
    Redis,
    /// In-process store; single-instance deployments only
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    pub stream_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.tick_interval_seconds == 0 {
            return Err("Scheduler tick_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_dispatch_attempts == 0 {
            return Err("Scheduler max_dispatch_attempts must be greater than 0".to_string());
        }
        if self.scheduler.dedup_record_ttl_seconds == 0 {
            return Err("Scheduler dedup_record_ttl_seconds must be greater than 0".to_string());
        }

        if self.scheduler.dedup_backend == DedupBackend::Redis && self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty when the redis dedup backend is selected"
                .to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings {
                enabled: true,
                tick_interval_seconds: 60,
                max_dispatch_attempts: 3,
                dedup_backend: DedupBackend::Redis,
                dedup_record_ttl_seconds: 3600,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            nats: NatsSettings {
                url: "nats://localhost:4222".to_string(),
                stream_name: "DISPATCH".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
            },
            schedule: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_tick_interval() {
        let mut settings = Settings::default();
        settings.scheduler.tick_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_dispatch_attempts() {
        let mut settings = Settings::default();
        settings.scheduler.max_dispatch_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_redis_url_for_redis_backend() {
        let mut settings = Settings::default();
        settings.redis.url = String::new();
        assert!(settings.validate().is_err());

        // The memory backend does not need Redis at all
        settings.scheduler.dedup_backend = DedupBackend::Memory;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_nats_settings() {
        let mut settings = Settings::default();
        settings.nats.url = String::new();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.nats.stream_name = String::new();
        assert!(settings.validate().is_err());
    }
}
