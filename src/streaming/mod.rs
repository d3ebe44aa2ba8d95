// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Streaming module - event fan-out, WebSocket transport, and data export

mod export;
mod hub;
mod websocket;

pub use export::*;
pub use hub::*;
pub use websocket::*;

#[cfg(test)]
pub(crate) use hub::testing;

use serde::{Deserialize, Serialize};

use crate::devices::DeviceStatus;

/// Broadcast event type for helmet status changes
pub const STATUS_UPDATE: &str = "status_update";

/// Broadcast event type for GPS fixes
pub const GPS_UPDATE: &str = "gps_update";

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Enable WebSocket server
    pub websocket_enabled: bool,
    pub bind_address: String,
    pub websocket_port: u16,
    pub websocket_max_clients: usize,

    /// Frames queued per connection before a slow peer is dropped
    pub send_queue_capacity: usize,

    /// Directed connections must present `?token=` matching the device token
    pub require_device_token: bool,

    /// Default format for exports
    pub export_format: ExportFormat,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            websocket_enabled: true,
            bind_address: "0.0.0.0".to_string(),
            websocket_port: 8000,
            websocket_max_clients: 64,
            send_queue_capacity: 256,
            require_device_token: false,
            export_format: ExportFormat::Json,
        }
    }
}

/// Export format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// Payload of a `status_update` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub device: String,
    pub status: DeviceStatus,
    pub timestamp: String,
}

/// Payload of a `gps_update` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsEvent {
    pub device: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: String,
}
