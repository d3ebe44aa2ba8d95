// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Main engine - the boundary request handlers talk to

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::interlock::{self, Verdict};
use super::SystemState;
use crate::alerts::{drunken_alert_text, GeoLocator, IpApiLocator, SmsNotifier, TwilioNotifier};
use crate::config::{AlertConfig, Config};
use crate::db::{
    now_iso, LocationRecord, LogLevel, LogRecord, Metadata, RecordCategory, RecordStore,
    StatusRecord,
};
use crate::devices::{Device, DeviceKind, DeviceRegistry, DeviceStatus};
use crate::pipeline::{JsonlSink, LogPipeline, LogSink, NullSink};
use crate::streaming::{
    BatchExporter, Connection, EventHub, ExportFormat, GpsEvent, GPS_UPDATE, STATUS_UPDATE,
};

/// Result of the bike polling for a helmet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub verdict: Verdict,
    pub record: Option<StatusRecord>,
}

/// Data behind the monitoring dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub logs: Vec<LogRecord>,
    pub helmet_location: Option<LocationRecord>,
    pub bike_location: Option<LocationRecord>,
    pub helmet_status: DeviceStatus,
    pub bike_status: DeviceStatus,
    pub last_update: String,
}

/// Builds an [`Engine`], optionally swapping out collaborators
pub struct EngineBuilder {
    config: Config,
    in_memory: bool,
    log_sink: Option<Arc<dyn LogSink>>,
    notifier: Option<Arc<dyn SmsNotifier>>,
    locator: Option<Arc<dyn GeoLocator>>,
}

impl EngineBuilder {
    /// Keep every store in memory and skip the journal
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn SmsNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn geo_locator(mut self, locator: Arc<dyn GeoLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Open the stores and start the log pipeline.
    ///
    /// Corrupt backing state fails the build.
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        let capacity = config.storage.capacity;
        let recent_capacity = config.pipeline.recent_capacity;

        let (statuses, locations, journal) = if self.in_memory {
            (
                RecordStore::in_memory(RecordCategory::Status, capacity),
                RecordStore::in_memory(RecordCategory::Location, capacity),
                None,
            )
        } else {
            let statuses =
                RecordStore::open(RecordCategory::Status, capacity, config.status_path()).await?;
            let locations =
                RecordStore::open(RecordCategory::Location, capacity, config.location_path())
                    .await?;
            let journal = JsonlSink::open(config.log_path(), recent_capacity).await?;
            (statuses, locations, Some(journal))
        };

        let recent = Arc::new(RecordStore::in_memory(RecordCategory::Log, recent_capacity));
        let sink: Arc<dyn LogSink> = match (self.log_sink, journal) {
            (Some(sink), _) => sink,
            (None, Some(journal)) => {
                let tail = journal.load_tail(recent_capacity).await?;
                info!("Restored {} recent logs from {:?}", tail.len(), journal.path());
                recent.extend(tail).await;
                Arc::new(journal)
            }
            (None, None) => Arc::new(NullSink),
        };

        let pipeline = LogPipeline::start(&config.pipeline, sink, recent);
        let notifier = self.notifier.or_else(|| notifier_from_config(&config.alerts));
        let locator = self.locator.or_else(|| locator_from_config(&config.alerts));

        Ok(Engine {
            config: Arc::new(config),
            registry: DeviceRegistry::new(),
            statuses: Arc::new(statuses),
            locations: Arc::new(locations),
            pipeline: Arc::new(pipeline),
            hub: EventHub::new(),
            notifier,
            locator,
            running: AtomicBool::new(false),
            start_time: Mutex::new(None),
            snapshot_stop: Arc::new(Notify::new()),
            snapshot_task: Mutex::new(None),
        })
    }
}

fn notifier_from_config(alerts: &AlertConfig) -> Option<Arc<dyn SmsNotifier>> {
    if !alerts.sms_enabled {
        return None;
    }
    match TwilioNotifier::from_config(alerts) {
        Ok(notifier) => Some(Arc::new(notifier)),
        Err(e) => {
            warn!("SMS alerts disabled: {}", e);
            None
        }
    }
}

fn locator_from_config(alerts: &AlertConfig) -> Option<Arc<dyn GeoLocator>> {
    if !alerts.geolocation_enabled {
        return None;
    }
    match IpApiLocator::from_config(alerts) {
        Ok(locator) => Some(Arc::new(locator)),
        Err(e) => {
            warn!("IP geolocation disabled: {}", e);
            None
        }
    }
}

/// Main HelmGuard engine.
///
/// Owns the device registry, the status and location stores, the log
/// pipeline and the event hub. Share it behind an `Arc`.
pub struct Engine {
    config: Arc<Config>,
    registry: DeviceRegistry,
    statuses: Arc<RecordStore<StatusRecord>>,
    locations: Arc<RecordStore<LocationRecord>>,
    pipeline: Arc<LogPipeline>,
    hub: EventHub,
    notifier: Option<Arc<dyn SmsNotifier>>,
    locator: Option<Arc<dyn GeoLocator>>,
    running: AtomicBool,
    start_time: Mutex<Option<Instant>>,
    snapshot_stop: Arc<Notify>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            in_memory: false,
            log_sink: None,
            notifier: None,
            locator: None,
        }
    }

    /// File-backed engine with collaborators taken from the config
    pub async fn open(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub async fn start(&self) -> Result<()> {
        info!("Starting HelmGuard engine...");
        *self.start_time.lock() = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        let task = self.spawn_snapshots();
        *self.snapshot_task.lock() = task;

        info!("HelmGuard engine started");
        Ok(())
    }

    /// Drain the log pipeline, then write final snapshots
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping HelmGuard engine...");
        self.running.store(false, Ordering::SeqCst);

        self.pipeline.drain_and_stop().await;

        self.snapshot_stop.notify_one();
        let task = self.snapshot_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Snapshot task failed: {}", e);
            }
        }
        self.flush_snapshots().await;

        info!("HelmGuard engine stopped");
        Ok(())
    }

    fn spawn_snapshots(&self) -> Option<JoinHandle<()>> {
        if self.statuses.snapshot_path().is_none() && self.locations.snapshot_path().is_none() {
            return None;
        }

        let statuses = self.statuses.clone();
        let locations = self.locations.clone();
        let stop = self.snapshot_stop.clone();
        let period = self.config.storage.snapshot_interval();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flush_store(&statuses).await;
                        flush_store(&locations).await;
                    }
                    _ = stop.notified() => break,
                }
            }
            debug!("Snapshot task stopped");
        }))
    }

    /// Write any dirty store to disk now
    pub async fn flush_snapshots(&self) {
        flush_store(&self.statuses).await;
        flush_store(&self.locations).await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> u64 {
        self.start_time.lock().map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub async fn state(&self) -> SystemState {
        SystemState {
            running: self.is_running(),
            uptime_seconds: self.uptime(),
            devices: self.registry.len().await,
            observers: self.hub.observer_count(),
            directed_connections: self.hub.directed_count(),
            events_published: self.hub.events_published(),
            status_records: self.statuses.len().await,
            location_records: self.locations.len().await,
            pipeline: self.pipeline.stats(),
        }
    }

    pub async fn register_device(&self, id: &str, kind: DeviceKind, token: Option<&str>) -> Device {
        self.registry.register(id, kind, token).await
    }

    pub async fn verify_token(&self, id: &str, token: &str) -> bool {
        self.registry.verify_token(id, token).await
    }

    /// Record a helmet status report and drive the interlock.
    ///
    /// The status is stored first; the bike signal, broadcast and SMS alert
    /// follow and cannot undo it.
    ///
    /// The registry, the status store and the directed send are not updated
    /// atomically together. Two concurrent reports for one helmet may reach
    /// the bike in a different order than they reached the store, so the bike
    /// must treat [`Engine::query_device_status`] as authoritative and use the
    /// pushed signal only as a hint to poll.
    pub async fn report_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        timestamp: &str,
        alcohol_level: Option<i32>,
    ) {
        self.registry.register(device_id, DeviceKind::Helmet, None).await;
        self.registry.set_status(device_id, status).await;

        let transition = interlock::on_status_report(device_id, status, timestamp, alcohol_level);
        self.statuses.upsert_by_key(transition.record.clone()).await;

        if let Some(audit) = transition.audit {
            self.pipeline.enqueue(audit);
        }

        if status == DeviceStatus::Drunken {
            self.spawn_sms_alert(device_id, alcohol_level);
        }

        if let Some(signal) = transition.signal {
            let bike_id = &self.config.pairing.bike_id;
            if !self.hub.send_directed(bike_id, signal.token()).await {
                debug!("{:?} not delivered to {}, bike will poll", signal, bike_id);
            }
        }

        self.publish(STATUS_UPDATE, &transition.event).await;
        info!("Device {} reported {}", device_id, status);
    }

    fn spawn_sms_alert(&self, device_id: &str, alcohol_level: Option<i32>) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let pipeline = self.pipeline.clone();
        let device_id = device_id.to_string();
        let body = drunken_alert_text(&device_id, alcohol_level);

        tokio::spawn(async move {
            if let Err(e) = notifier.send(&body).await {
                warn!("SMS alert for {} failed: {}", device_id, e);
                pipeline.enqueue(LogRecord::new(
                    &device_id,
                    LogLevel::Error,
                    format!("Failed to send SMS: {}", e),
                    None,
                    None,
                ));
            }
        });
    }

    /// Latest status of `device_id` and what the bike should do about it
    pub async fn query_device_status(&self, device_id: &str) -> StatusQuery {
        let record = self.statuses.get_by_key(device_id).await;
        StatusQuery {
            verdict: interlock::verdict(record.as_ref()),
            record,
        }
    }

    /// Every retained status record, oldest first
    pub async fn statuses(&self) -> Vec<StatusRecord> {
        self.statuses.get_recent(self.statuses.capacity()).await
    }

    pub async fn report_location(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        timestamp: &str,
        ip_location: Option<Metadata>,
    ) {
        self.registry.touch(device_id).await;

        self.locations
            .append(LocationRecord {
                device_id: device_id.to_string(),
                latitude,
                longitude,
                timestamp: timestamp.to_string(),
                ip_location,
            })
            .await;

        let event = GpsEvent {
            device: device_id.to_string(),
            latitude,
            longitude,
            timestamp: timestamp.to_string(),
        };
        self.publish(GPS_UPDATE, &event).await;
    }

    /// Like [`Engine::report_location`], resolving the reporter's IP first.
    ///
    /// A failed lookup stores the fix without `ip_location`.
    pub async fn report_location_from_ip(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        timestamp: &str,
        ip: Option<&str>,
    ) {
        let ip_location = match (ip, &self.locator) {
            (Some(ip), Some(locator)) => match locator.locate(ip).await {
                Ok(location) => Some(location),
                Err(e) => {
                    warn!("IP lookup for {} failed: {}", ip, e);
                    None
                }
            },
            _ => None,
        };

        self.report_location(device_id, latitude, longitude, timestamp, ip_location)
            .await;
    }

    /// Queue a log line; `timestamp` defaults to now
    pub fn submit_log(
        &self,
        device_id: &str,
        level: LogLevel,
        message: &str,
        timestamp: Option<String>,
        metadata: Option<Metadata>,
    ) {
        self.pipeline
            .enqueue(LogRecord::new(device_id, level, message, timestamp, metadata));
    }

    /// Flushed logs, oldest first
    pub async fn recent_logs(&self, limit: usize) -> Vec<LogRecord> {
        self.pipeline.recent(limit).await
    }

    /// GPS fixes, oldest first, optionally for one device
    pub async fn recent_locations(&self, device_id: Option<&str>, limit: usize) -> Vec<LocationRecord> {
        match device_id {
            Some(id) => self.locations.get_recent_where(limit, |r| r.device_id == id).await,
            None => self.locations.get_recent(limit).await,
        }
    }

    /// Attach an observer to the broadcast set
    pub fn open_broadcast_connection(&self, connection: Arc<dyn Connection>) -> String {
        self.hub.accept_broadcast(connection)
    }

    pub fn close_broadcast_connection(&self, connection_id: &str) -> bool {
        self.hub.remove_broadcast(connection_id)
    }

    /// Attach the device's directed channel, registering it as a bike on
    /// first sight
    pub async fn open_directed_connection(
        &self,
        device_id: &str,
        connection: Arc<dyn Connection>,
    ) -> String {
        self.registry.register(device_id, DeviceKind::Bike, None).await;
        let id = connection.id().to_string();
        self.hub.accept_directed(device_id, connection);
        id
    }

    pub fn close_directed_connection(&self, device_id: &str, connection_id: &str) -> bool {
        self.hub.release_directed(device_id, connection_id)
    }

    pub async fn dashboard(&self) -> DashboardSnapshot {
        let pairing = &self.config.pairing;
        DashboardSnapshot {
            logs: self.recent_logs(100).await,
            helmet_location: self.last_location(&pairing.helmet_id).await,
            bike_location: self.last_location(&pairing.bike_id).await,
            helmet_status: self.latest_status(&pairing.helmet_id).await,
            bike_status: self.latest_status(&pairing.bike_id).await,
            last_update: now_iso(),
        }
    }

    async fn last_location(&self, device_id: &str) -> Option<LocationRecord> {
        self.locations
            .get_recent_where(1, |r| r.device_id == device_id)
            .await
            .pop()
    }

    async fn latest_status(&self, device_id: &str) -> DeviceStatus {
        self.statuses
            .get_by_key(device_id)
            .await
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Write up to 1000 recent logs; returns how many were written
    pub async fn export_logs<W: Write>(&self, format: ExportFormat, writer: &mut W) -> Result<usize> {
        let logs = self.recent_logs(1000).await;
        BatchExporter::new(format).export_logs(&logs, writer)?;
        Ok(logs.len())
    }

    pub async fn export_locations<W: Write>(
        &self,
        format: ExportFormat,
        device_id: Option<&str>,
        writer: &mut W,
    ) -> Result<usize> {
        let locations = self.recent_locations(device_id, 1000).await;
        BatchExporter::new(format).export_locations(&locations, writer)?;
        Ok(locations.len())
    }

    async fn publish<T: Serialize>(&self, event_type: &str, payload: &T) {
        if let Err(e) = self.hub.broadcast_event(event_type, payload).await {
            error!("Failed to encode {} event: {}", event_type, e);
        }
    }
}

async fn flush_store<R>(store: &RecordStore<R>)
where
    R: Clone + Serialize + serde::de::DeserializeOwned + Send,
{
    match store.flush().await {
        Ok(true) => debug!("Snapshot written for {} store", store.category()),
        Ok(false) => {}
        Err(e) => error!("Failed to snapshot {} store: {}", store.category(), e),
    }
}
