// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Device identity and live status

mod registry;

pub use registry::DeviceRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of device taking part in the interlock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Helmet,
    Bike,
}

/// Safety status of a device.
///
/// A sober helmet is `"safe"` on the wire, in snapshots and in
/// `status_update` events. Older deployments emitted `"not_drunken"`; it is
/// still accepted on input, but consumers matching on it must switch to
/// `"safe"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    #[serde(alias = "not_drunken")]
    Safe,
    Drunken,
    Override,
}

impl DeviceStatus {
    /// Stable wire literal
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Safe => "safe",
            DeviceStatus::Drunken => "drunken",
            DeviceStatus::Override => "override",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}
