//! Configuration management.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default time a workspace may wait on its extensions before readiness fails.
const DEFAULT_READINESS_TIMEOUT_MS: u64 = 60_000;

/// Default capacity of each per-table mirror write queue.
const DEFAULT_MIRROR_QUEUE_CAPACITY: usize = 1024;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Readiness timeout in milliseconds. `null` waits forever.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: Option<u64>,
    /// Mirror synchronization settings.
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Mirror synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Attach a SQLite mirror to every workspace.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pending incremental writes allowed per table before it falls back to a resync.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_readiness_timeout_ms() -> Option<u64> {
    Some(DEFAULT_READINESS_TIMEOUT_MS)
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_MIRROR_QUEUE_CAPACITY
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: DEFAULT_MIRROR_QUEUE_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            readiness_timeout_ms: Some(DEFAULT_READINESS_TIMEOUT_MS),
            mirror: MirrorConfig::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `<base>/config.json`, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Readiness timeout as a duration.
    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.mirror.queue_capacity == 0 {
            return Err(CoreError::Config(
                "mirror.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Only the log level can be overridden at runtime.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("KEEL_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.readiness_timeout(), Some(Duration::from_secs(60)));
        assert!(config.mirror.enabled);
        assert_eq!(config.mirror.queue_capacity, 1024);
    }

    #[test]
    fn test_config_load_from_file_fills_missing_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        std::fs::write(&config_path, r#"{ "log_level": "debug" }"#).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.readiness_timeout_ms, Some(60_000));
        assert_eq!(config.mirror.queue_capacity, 1024);
    }

    #[test]
    fn test_null_timeout_disables_it() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        std::fs::write(&config_path, r#"{ "readiness_timeout_ms": null }"#).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.readiness_timeout(), None);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.mirror.queue_capacity = 16;
        config.readiness_timeout_ms = Some(250);
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.mirror.queue_capacity, 16);
        assert_eq!(loaded.readiness_timeout_ms, Some(250));
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert!(config.mirror.enabled);
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        std::fs::write(
            paths.config_file(),
            r#"{ "mirror": { "queue_capacity": 0 } }"#,
        )
        .unwrap();

        let result = Config::load(&paths);
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ not json").unwrap();

        assert!(matches!(
            Config::load_from_file(&config_path),
            Err(CoreError::Json(_))
        ));
    }
}
