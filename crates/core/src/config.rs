//! Configuration management for Murmur.
//!
//! Every field has a default, so a partial TOML file (or none at all) yields a
//! usable configuration.

use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Reference staleness threshold for mesh peers (3 minutes).
pub const DEFAULT_STALE_AFTER_SECS: u64 = 180;

/// Default identity record name in secure storage.
pub const DEFAULT_IDENTITY_RECORD: &str = "murmur.identity.v1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub session: SessionConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

/// Peer Registry liveness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Age after which a peer no longer counts as active
    pub stale_after_secs: u64,
    /// Period of the background staleness sweep
    pub sweep_interval_secs: u64,
    /// Evict stale records older than this; `None` keeps them until removed
    pub retention_secs: Option<u64>,
    /// Capacity of the presence notification channel
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            sweep_interval_secs: 60,
            retention_secs: None,
            event_capacity: 256,
        }
    }
}

impl RegistryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

/// Session Establisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// An unanswered handshake older than this may be replaced
    pub handshake_timeout_ms: u64,
    /// How long a superseded generation still decrypts
    pub rotation_grace_secs: u64,
    /// Messages sealed under one generation before rotation is advised
    pub max_messages_per_generation: u64,
    /// Generation lifetime before rotation is advised
    pub max_generation_age_secs: u64,
    /// Capacity of the session notification channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            rotation_grace_secs: 60,
            max_messages_per_generation: 10_000,
            max_generation_age_secs: 3_600,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rotation_grace(&self) -> Duration {
        Duration::from_secs(self.rotation_grace_secs)
    }

    pub fn max_generation_age(&self) -> Duration {
        Duration::from_secs(self.max_generation_age_secs)
    }
}

/// Identity Key Store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name of the identity record in secure storage
    pub record_name: String,
    /// Directory used by file-backed secure storage
    pub storage_dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            record_name: DEFAULT_IDENTITY_RECORD.to_string(),
            storage_dir: PathBuf::from(".murmur"),
        }
    }
}

/// Log output settings. `RUST_LOG`, when set, overrides `level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info,murmur_session=debug`
    pub level: String,
    /// Emit one JSON object per event
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make liveness or sessions meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.registry.stale_after_secs == 0 {
            return Err(CoreError::Config(
                "registry.stale_after_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(retention) = self.registry.retention_secs {
            if retention < self.registry.stale_after_secs {
                return Err(CoreError::Config(format!(
                    "registry.retention_secs ({}) must not be shorter than stale_after_secs ({})",
                    retention, self.registry.stale_after_secs
                )));
            }
        }
        if self.registry.event_capacity == 0 || self.session.event_capacity == 0 {
            return Err(CoreError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.identity.record_name.is_empty() {
            return Err(CoreError::Config(
                "identity.record_name must not be empty".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(CoreError::Config(
                "logging.level must not be empty".to_string(),
            ));
        }
        if self.registry.sweep_interval_secs > self.registry.stale_after_secs {
            tracing::warn!(
                sweep_interval_secs = self.registry.sweep_interval_secs,
                stale_after_secs = self.registry.stale_after_secs,
                "sweep interval exceeds staleness threshold; inactivity notifications will lag"
            );
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.stale_after(), Duration::from_secs(180));
        assert_eq!(config.registry.retention(), None);
        assert_eq!(config.identity.record_name, DEFAULT_IDENTITY_RECORD);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [registry]
            stale_after_secs = 30
            retention_secs = 600

            [session]
            rotation_grace_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.registry.stale_after_secs, 30);
        assert_eq!(config.registry.retention(), Some(Duration::from_secs(600)));
        assert_eq!(config.registry.sweep_interval_secs, 60);
        assert_eq!(config.session.rotation_grace(), Duration::from_secs(5));
        assert_eq!(config.session.handshake_timeout_ms, 30_000);
    }

    #[test]
    fn test_retention_shorter_than_staleness_rejected() {
        let result = Config::from_toml_str(
            r#"
            [registry]
            stale_after_secs = 180
            retention_secs = 10
            "#,
        );
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_zero_staleness_rejected() {
        let mut config = Config::default();
        config.registry.stale_after_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.toml");
        std::fs::write(&path, "[identity]\nrecord_name = \"test.identity\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.identity.record_name, "test.identity");
    }

    #[test]
    fn test_logging_section() {
        let config = Config::from_toml_str(
            r#"
            [logging]
            level = "warn,murmur_session=debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "warn,murmur_session=debug");
        assert!(config.logging.json);
        assert_eq!(Config::default().logging, LoggingConfig::default());

        let mut config = Config::default();
        config.logging.level = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slow_sweep_is_accepted() {
        let mut config = Config::default();
        config.registry.sweep_interval_secs = config.registry.stale_after_secs * 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let mut config = RegistryConfig::default();
        config.sweep_interval_secs = 0;
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
