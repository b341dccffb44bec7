//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use blecentral_core::{ControllerConfig, DedupPolicy, MtuPolicy};
use serde::{Deserialize, Serialize};

/// Configuration file structure
///
/// Every field is optional; unset values fall back to the controller
/// defaults. Only CLI preferences live here, never device data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Default scan window in seconds
    #[serde(default)]
    pub scan_duration: Option<u64>,

    /// Delay between consecutive controller commands, in milliseconds
    #[serde(default)]
    pub settle_interval_ms: Option<u64>,

    /// MTU requested after service discovery
    #[serde(default)]
    pub target_mtu: Option<u16>,

    /// Accept any negotiated MTU of at least this value instead of requiring
    /// the exact target
    #[serde(default)]
    pub mtu_floor: Option<u16>,

    /// Deduplication of repeated advertisements
    #[serde(default)]
    pub dedup: Option<DedupPolicy>,
}

impl Config {
    /// Get the config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blecentral")
            .join("config.toml")
    }

    /// Load config from the default path, or return default if not found
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, or return default if missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// A config with every value filled in from the controller defaults.
    pub fn with_defaults() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            scan_duration: Some(crate::cli::DEFAULT_SCAN_SECS),
            settle_interval_ms: Some(defaults.settle_interval.as_millis() as u64),
            target_mtu: Some(defaults.target_mtu),
            mtu_floor: None,
            dedup: Some(defaults.dedup),
        }
    }

    /// Build the controller configuration, applying a command-line dedup
    /// override.
    pub fn controller_config(&self, dedup: Option<DedupPolicy>) -> Result<ControllerConfig> {
        let mut config = ControllerConfig::default();
        if let Some(ms) = self.settle_interval_ms {
            config = config.settle_interval(Duration::from_millis(ms));
        }
        if let Some(mtu) = self.target_mtu {
            config = config.target_mtu(mtu);
        }
        if let Some(floor) = self.mtu_floor {
            config = config.mtu_policy(MtuPolicy::AtLeast(floor));
        }
        if let Some(policy) = dedup.or(self.dedup) {
            config = config.dedup(policy);
        }
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", Self::path().display()))?;
        Ok(config)
    }
}

/// Resolve scan duration: explicit flag, then config, then default
pub fn resolve_scan_duration(flag: Option<u64>, config: &Config, default: u64) -> u64 {
    flag.or(config.scan_duration).unwrap_or(default)
}
