// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Persisted record types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::devices::DeviceStatus;

/// Free-form key/value attachment
pub type Metadata = Map<String, Value>;

/// Records that are unique per key inside a store
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Latest reported status of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(alias = "uuid")]
    pub device_id: String,
    pub status: DeviceStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alcohol_level: Option<i32>,
}

impl Keyed for StatusRecord {
    fn key(&self) -> &str {
        &self.device_id
    }
}

/// Severity/category of a device log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Error,
    Action,
    Warn,
    Security,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
            LogLevel::Action => "ACTION",
            LogLevel::Warn => "WARN",
            LogLevel::Security => "SECURITY",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One device log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(alias = "device")]
    pub device_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl LogRecord {
    /// Build a record, stamping it with the current time when none is given
    pub fn new(
        device_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
        timestamp: Option<String>,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            level,
            message: message.into(),
            timestamp: timestamp.unwrap_or_else(now_iso),
            metadata,
        }
    }
}

/// One GPS fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(alias = "device")]
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_location: Option<Metadata>,
}

/// Current time as an RFC 3339 string
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
