//! Send pipeline configuration
//!
//! Read from `~/.keepkey/send.json`. Every field is optional in the file; a
//! missing file means all defaults.

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chains::ScriptType;
use crate::errors::{Result, SendError};
use crate::signing::{DEFAULT_CANCEL_NOTIFY_TIMEOUT, DEFAULT_EVENT_CAPACITY, DEFAULT_SESSION_TIMEOUT};
use crate::sources::FeeTier;

/// Standard relay dust limit for the output types we create
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Get the default config file path
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".keepkey")
        .join("send.json")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendConfig {
    pub network: Network,
    pub dust_threshold: u64,
    pub min_confirmations: u32,
    pub default_fee_tier: FeeTier,
    /// Preferred script type for change; falls back to a native segwit key
    pub change_script_type: Option<ScriptType>,
    pub tx_version: u32,
    pub lock_time: u32,
    #[serde(with = "humantime_serde_str")]
    pub session_timeout: Duration,
    #[serde(with = "humantime_serde_str")]
    pub cancel_notify_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            min_confirmations: 0,
            default_fee_tier: FeeTier::Medium,
            change_script_type: None,
            tx_version: 1,
            lock_time: 0,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            cancel_notify_timeout: DEFAULT_CANCEL_NOTIFY_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SendConfig {
    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No send config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| SendError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: SendConfig = serde_json::from_str(&text)
            .map_err(|e| SendError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        log::info!("📋 Loaded send config from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SendError::Config(format!("failed to create {}: {}", parent.display(), e)))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| SendError::Config(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| SendError::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.dust_threshold == 0 {
            return Err(SendError::Config("dustThreshold must be greater than 0".to_string()));
        }
        if self.session_timeout.is_zero() {
            return Err(SendError::Config("sessionTimeout must be greater than 0".to_string()));
        }
        if self.cancel_notify_timeout.is_zero() {
            return Err(SendError::Config("cancelNotifyTimeout must be greater than 0".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(SendError::Config("eventCapacity must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Durations as human strings ("10m", "5s")
mod humantime_serde_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
