// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Configuration module

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::streaming::StreamingConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Data directory holding snapshots and the log journal
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Which helmet drives which bike
    pub pairing: PairingConfig,

    /// Record store configuration
    pub storage: StorageConfig,

    /// Log pipeline configuration
    pub pipeline: PipelineConfig,

    /// Streaming configuration
    pub streaming: StreamingConfig,

    /// External alerting collaborators
    pub alerts: AlertConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "HelmGuard".to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            pairing: PairingConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            streaming: StreamingConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Fill alert credentials from the process environment.
    ///
    /// Values already present in the file win over the environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let alerts = &mut self.alerts;
        for (slot, key) in [
            (&mut alerts.account_sid, "TWILIO_ACCOUNT_SID"),
            (&mut alerts.auth_token, "TWILIO_AUTH_TOKEN"),
            (&mut alerts.from_number, "TWILIO_PHONE_NUMBER"),
            (&mut alerts.to_number, "ALERT_PHONE_NUMBER"),
        ] {
            if slot.is_none() {
                *slot = lookup(key).filter(|v| !v.is_empty());
            }
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("helmguard"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Path of the status snapshot
    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.status_file)
    }

    /// Path of the location snapshot
    pub fn location_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.location_file)
    }

    /// Path of the append-only log journal
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.pipeline.log_file)
    }
}

/// Helmet/bike pairing. The system assumes exactly one of each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Helmet whose status drives the interlock
    pub helmet_id: String,

    /// Bike that receives the directed block/allow signal
    pub bike_id: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            helmet_id: "helmet-001".to_string(),
            bike_id: "bike-001".to_string(),
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum records retained per store
    pub capacity: usize,

    /// Status snapshot file name, relative to `data_dir`
    pub status_file: String,

    /// Location snapshot file name, relative to `data_dir`
    pub location_file: String,

    /// Interval between snapshots of dirty stores
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            status_file: "status.json".to_string(),
            location_file: "gps.json".to_string(),
            snapshot_interval_secs: 5,
        }
    }
}

impl StorageConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }
}

/// Log pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Records per flush
    pub batch_size: usize,

    /// Maximum age of the first record of a batch before it is flushed
    pub flush_interval_ms: u64,

    /// Pause after a failed flush
    pub failure_backoff_ms: u64,

    /// Log journal file name, relative to `data_dir`
    pub log_file: String,

    /// Size of the in-memory recent log cache
    pub recent_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval_ms: 5000,
            failure_backoff_ms: 1000,
            log_file: "logs.jsonl".to_string(),
            recent_capacity: 1000,
        }
    }
}

impl PipelineConfig {
    /// Never zero, so an idle worker still sleeps between polls
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

/// SMS and geolocation collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Send an SMS when a helmet reports alcohol
    pub sms_enabled: bool,

    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,

    /// Resolve reporter IPs to a coarse location
    pub geolocation_enabled: bool,

    /// Base URL; the IP is appended
    pub geolocation_url: Option<String>,

    /// Timeout for outbound requests
    pub request_timeout_secs: Option<u64>,
}

impl AlertConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(10))
    }

    pub fn geolocation_base(&self) -> &str {
        self.geolocation_url.as_deref().unwrap_or("http://ip-api.com/json/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.pairing.bike_id, "bike-001");
        assert_eq!(parsed.storage.capacity, 1000);
        assert_eq!(parsed.pipeline.batch_size, 10);
        assert_eq!(parsed.pipeline.flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[pipeline]\nbatch_size = 3\n").unwrap();
        assert_eq!(parsed.pipeline.batch_size, 3);
        assert_eq!(parsed.pipeline.recent_capacity, 1000);
        assert_eq!(parsed.pairing.helmet_id, "helmet-001");
    }

    #[test]
    fn test_zero_flush_interval_is_clamped() {
        let parsed: Config = toml::from_str("[pipeline]\nflush_interval_ms = 0\n").unwrap();
        assert_eq!(parsed.pipeline.flush_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_env_fills_only_missing_credentials() {
        let mut config = Config::default();
        config.alerts.account_sid = Some("from-file".to_string());

        config.apply_env_from(|key| match key {
            "TWILIO_ACCOUNT_SID" => Some("from-env".to_string()),
            "ALERT_PHONE_NUMBER" => Some("+15550100".to_string()),
            "TWILIO_AUTH_TOKEN" => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.alerts.account_sid.as_deref(), Some("from-file"));
        assert_eq!(config.alerts.to_number.as_deref(), Some("+15550100"));
        assert!(config.alerts.auth_token.is_none());
        assert!(config.alerts.from_number.is_none());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = std::env::temp_dir().join(format!("helmguard-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.pairing.bike_id, created.pairing.bike_id);

        let _ = std::fs::remove_dir_all(dir);
    }
}
