use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/odm/config.toml";
const DEFAULT_HASH_LOG_PATH: &str = "/var/lib/odm/hash_log.json";

/// Smallest poll interval accepted for device enumeration.
const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[error("slot_count must be at least 1")]
    ZeroSlots,
    #[error("poll_interval_ms must be at least {MIN_POLL_INTERVAL_MS} (got {0})")]
    PollIntervalTooShort(u64),
    #[error("tool_path must not be empty")]
    EmptyToolPath,
}

/// Typed runtime configuration.
///
/// Values are layered: built-in defaults, then the TOML file, then `ODM_*`
/// environment variables, then command-line overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Cloning tool executable. Resolved through `PATH` when not absolute.
    pub tool_path: PathBuf,
    /// Image restored onto every drive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    pub max_concurrent: usize,
    pub auto_clone_on_insert: bool,
    pub slot_count: usize,
    pub poll_interval_ms: u64,
    /// Passed verbatim after the restore arguments.
    pub restore_flags: Vec<String>,
    /// Passed verbatim between `-backup` and the source/target arguments.
    pub backup_flags: Vec<String>,
    /// Consecutive unchanged-size ticks before a backup is reported as stalled.
    pub stall_ticks: u32,
    /// Where `odm hash` records each file's last digests.
    pub hash_log_path: PathBuf,
    /// An image last hashed at least this many days ago gets a warning.
    pub hash_stale_days: u32,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("odinc"),
            image: None,
            max_concurrent: 2,
            auto_clone_on_insert: false,
            slot_count: 5,
            poll_interval_ms: 2000,
            restore_flags: vec!["-force".to_string()],
            backup_flags: vec!["-allBlocks".to_string(), "-compression=none".to_string()],
            stall_ticks: 15,
            hash_log_path: PathBuf::from(DEFAULT_HASH_LOG_PATH),
            hash_stale_days: 30,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `config_path` (or the default location), the
    /// environment, and optional command-line overrides.
    ///
    /// A missing config file is not an error.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> anyhow::Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ODM_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.slot_count == 0 {
            return Err(ConfigError::ZeroSlots);
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::PollIntervalTooShort(self.poll_interval_ms));
        }
        if self.tool_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyToolPath);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
