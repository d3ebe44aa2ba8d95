// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Device registry - authoritative in-memory device status

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Device, DeviceKind, DeviceStatus};

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, Device>,
    /// Registration order, used by kind lookups
    order: Vec<String>,
}

/// Tracks every device seen since startup.
///
/// All operations serialize on one lock so status and `last_seen` always
/// change together.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device or refresh an existing one.
    ///
    /// A repeat registration keeps the original kind and status, bumps
    /// `last_seen`, and replaces the token only when a non-empty one is given.
    pub async fn register(&self, id: &str, kind: DeviceKind, token: Option<&str>) -> Device {
        let mut inner = self.inner.lock().await;
        let token = token.filter(|t| !t.is_empty());

        if let Some(device) = inner.devices.get_mut(id) {
            device.last_seen = Utc::now();
            if let Some(token) = token {
                device.auth_token = Some(token.to_string());
            }
            return device.clone();
        }

        let device = Device {
            id: id.to_string(),
            kind,
            status: DeviceStatus::Unknown,
            last_seen: Utc::now(),
            auth_token: token.map(str::to_string),
        };
        inner.devices.insert(id.to_string(), device.clone());
        inner.order.push(id.to_string());

        info!("Registered device: {} ({:?})", id, kind);
        device
    }

    /// Returns false without error when `id` was never registered
    pub async fn set_status(&self, id: &str, status: DeviceStatus) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(id) {
            Some(device) => {
                device.status = status;
                device.last_seen = Utc::now();
                debug!("Device {} status -> {}", id, status);
                true
            }
            None => false,
        }
    }

    /// Refresh `last_seen` for a known device
    pub async fn touch(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(id) {
            Some(device) => {
                device.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn get_status(&self, id: &str) -> Option<DeviceStatus> {
        self.inner.lock().await.devices.get(id).map(|d| d.status)
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        self.inner.lock().await.devices.get(id).cloned()
    }

    /// Status of the first registered device of `kind`, or `Unknown`.
    ///
    /// Assumes a single helmet and a single bike; with several devices of one
    /// kind only the earliest registration is consulted.
    pub async fn find_status_by_kind(&self, kind: DeviceKind) -> DeviceStatus {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id))
            .find(|d| d.kind == kind)
            .map(|d| d.status)
            .unwrap_or_default()
    }

    /// False for unknown devices and for devices that never set a token
    pub async fn verify_token(&self, id: &str, token: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .devices
            .get(id)
            .and_then(|d| d.auth_token.as_deref())
            .is_some_and(|expected| expected == token)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All devices in registration order
    pub async fn list(&self) -> Vec<Device> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id).cloned())
            .collect()
    }
}
