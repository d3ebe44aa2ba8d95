// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Event hub - broadcast observers plus one directed connection per device

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SendError;

/// A duplex channel to one external peer
#[async_trait]
pub trait Connection: Send + Sync {
    /// Unique for the lifetime of the process
    fn id(&self) -> &str;

    async fn send_text(&self, text: &str) -> Result<(), SendError>;
}

/// Envelope delivered to broadcast observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections removed because the send failed
    pub dropped: Vec<String>,
}

/// Central fan-out point for observers and device channels.
///
/// Sends never run under a lock: membership is snapshotted, delivery is
/// attempted on every member independently, then failed members are swept.
pub struct EventHub {
    observers: RwLock<HashMap<String, Arc<dyn Connection>>>,
    directed: RwLock<HashMap<String, Arc<dyn Connection>>>,
    event_counter: AtomicU64,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            directed: RwLock::new(HashMap::new()),
            event_counter: AtomicU64::new(0),
        }
    }

    /// Add an observer; returns its connection id
    pub fn accept_broadcast(&self, connection: Arc<dyn Connection>) -> String {
        let id = connection.id().to_string();
        self.observers.write().insert(id.clone(), connection);
        debug!("Observer {} joined ({} total)", id, self.observer_count());
        id
    }

    pub fn remove_broadcast(&self, connection_id: &str) -> bool {
        self.observers.write().remove(connection_id).is_some()
    }

    /// Route directed messages for `device_id` to `connection`.
    ///
    /// The superseded connection is returned, not closed.
    pub fn accept_directed(
        &self,
        device_id: &str,
        connection: Arc<dyn Connection>,
    ) -> Option<Arc<dyn Connection>> {
        let previous = self.directed.write().insert(device_id.to_string(), connection);
        if previous.is_some() {
            info!("Device {} reconnected, replacing directed connection", device_id);
        } else {
            info!("Device {} connected", device_id);
        }
        previous
    }

    /// Forget the directed connection for `device_id`, whichever it is
    pub fn disconnect_directed(&self, device_id: &str) -> bool {
        self.directed.write().remove(device_id).is_some()
    }

    /// Forget the directed connection for `device_id` only if it is still
    /// `connection_id`; a newer connection for the same device is left alone.
    pub fn release_directed(&self, device_id: &str, connection_id: &str) -> bool {
        let mut directed = self.directed.write();
        match directed.get(device_id) {
            Some(current) if current.id() == connection_id => {
                directed.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_directed_connected(&self, device_id: &str) -> bool {
        self.directed.read().contains_key(device_id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn directed_count(&self) -> usize {
        self.directed.read().len()
    }

    /// Events broadcast since startup
    pub fn events_published(&self) -> u64 {
        self.event_counter.load(Ordering::Relaxed)
    }

    /// Deliver `{type, data}` to every observer
    pub async fn broadcast(&self, event_type: &str, payload: Value) -> BroadcastReport {
        self.event_counter.fetch_add(1, Ordering::Relaxed);

        let text = serde_json::json!({
            "type": event_type,
            "data": payload,
        })
        .to_string();

        let targets: Vec<Arc<dyn Connection>> = self.observers.read().values().cloned().collect();

        let results = join_all(targets.iter().map(|connection| {
            let text = text.as_str();
            async move { (connection.id(), connection.send_text(text).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping observer {}: {}", id, e);
                    report.dropped.push(id.to_string());
                }
            }
        }

        if !report.dropped.is_empty() {
            let mut observers = self.observers.write();
            for id in &report.dropped {
                observers.remove(id);
            }
        }

        debug!(
            "Broadcast {} to {} observers ({} dropped)",
            event_type,
            report.delivered,
            report.dropped.len()
        );
        report
    }

    /// Serialize `payload` and broadcast it
    pub async fn broadcast_event<T: Serialize>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        Ok(self.broadcast(event_type, value).await)
    }

    /// Best-effort delivery to the device's directed connection.
    ///
    /// Returns false when no connection is registered or the send failed; a
    /// failed connection is removed.
    pub async fn send_directed(&self, device_id: &str, message: &str) -> bool {
        let connection = self.directed.read().get(device_id).cloned();
        let Some(connection) = connection else {
            debug!("No directed connection for {}", device_id);
            return false;
        };

        match connection.send_text(message).await {
            Ok(()) => {
                debug!("Sent {:?} to {}", message, device_id);
                true
            }
            Err(e) => {
                warn!("Directed send to {} failed: {}", device_id, e);
                self.release_directed(device_id, connection.id());
                false
            }
        }
    }
}
