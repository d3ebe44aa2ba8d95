// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Bounded, append/replace record store with JSON snapshot persistence

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Keyed, RecordCategory};
use crate::error::StoreError;

struct StoreState<R> {
    records: VecDeque<R>,
    /// Bumped on every mutation
    generation: u64,
    /// Generation last written to the snapshot file
    persisted: u64,
}

/// Capacity-bounded record collection for one category.
///
/// The in-memory copy is authoritative. Every read-modify-write runs under a
/// single lock; the snapshot file is only a serialization of it.
pub struct RecordStore<R> {
    category: RecordCategory,
    capacity: usize,
    state: Mutex<StoreState<R>>,
    snapshot: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl<R> RecordStore<R>
where
    R: Clone + Serialize + DeserializeOwned + Send,
{
    /// Store without a backing file
    pub fn in_memory(category: RecordCategory, capacity: usize) -> Self {
        Self::from_records(category, capacity, VecDeque::new(), None)
    }

    /// Open a file-backed store, creating an empty snapshot when missing.
    ///
    /// A snapshot that fails to decode is a fatal [`StoreError::Corrupt`].
    pub async fn open(
        category: RecordCategory,
        capacity: usize,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        if !tokio::fs::try_exists(&path).await.map_err(|e| StoreError::io(&path, e))? {
            tokio::fs::write(&path, b"[]")
                .await
                .map_err(|e| StoreError::io(&path, e))?;
        }

        let content = tokio::fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
        let records: Vec<R> = serde_json::from_slice(&content).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        info!("Opened {} store at {:?} ({} records)", category, path, records.len());
        Ok(Self::from_records(category, capacity, records.into(), Some(path)))
    }

    fn from_records(
        category: RecordCategory,
        capacity: usize,
        mut records: VecDeque<R>,
        snapshot: Option<PathBuf>,
    ) -> Self {
        trim(&mut records, capacity);
        Self {
            category,
            capacity,
            state: Mutex::new(StoreState {
                records,
                generation: 0,
                persisted: 0,
            }),
            snapshot,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn category(&self) -> RecordCategory {
        self.category
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Append unconditionally, evicting the oldest records past capacity
    pub async fn append(&self, record: R) {
        let mut state = self.state.lock().await;
        state.records.push_back(record);
        trim(&mut state.records, self.capacity);
        state.generation += 1;
    }

    /// Append a batch in order under one lock acquisition
    pub async fn extend(&self, records: impl IntoIterator<Item = R>) {
        let mut state = self.state.lock().await;
        state.records.extend(records);
        trim(&mut state.records, self.capacity);
        state.generation += 1;
    }

    /// Most recent `limit` records, oldest first
    pub async fn get_recent(&self, limit: usize) -> Vec<R> {
        self.get_recent_where(limit, |_| true).await
    }

    /// Most recent `limit` records matching `filter`, oldest first
    pub async fn get_recent_where<F>(&self, limit: usize, filter: F) -> Vec<R>
    where
        F: Fn(&R) -> bool,
    {
        let state = self.state.lock().await;
        let mut recent: Vec<R> = state
            .records
            .iter()
            .rev()
            .filter(|r| filter(r))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// True when the in-memory state is ahead of the snapshot
    pub async fn is_dirty(&self) -> bool {
        let state = self.state.lock().await;
        self.snapshot.is_some() && state.generation != state.persisted
    }

    /// Write the snapshot if anything changed since the last write.
    ///
    /// Returns whether a file was written. The data lock is only held long
    /// enough to copy the records out.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let Some(path) = self.snapshot.as_deref() else {
            return Ok(false);
        };
        let _persist = self.persist_lock.lock().await;

        let (generation, records) = {
            let state = self.state.lock().await;
            if state.generation == state.persisted {
                return Ok(false);
            }
            (state.generation, state.records.iter().cloned().collect::<Vec<_>>())
        };

        let bytes = serde_json::to_vec_pretty(&records)?;
        write_atomic(path, &bytes).await?;

        let mut state = self.state.lock().await;
        state.persisted = state.persisted.max(generation);
        debug!("Flushed {} store ({} records)", self.category, records.len());
        Ok(true)
    }
}

impl<R> RecordStore<R>
where
    R: Keyed + Clone + Serialize + DeserializeOwned + Send,
{
    /// Replace any record with the same key, then append and trim.
    ///
    /// No two records with the same key survive this call.
    pub async fn upsert_by_key(&self, record: R) {
        let mut state = self.state.lock().await;
        state.records.retain(|r| r.key() != record.key());
        state.records.push_back(record);
        trim(&mut state.records, self.capacity);
        state.generation += 1;
    }

    /// Linear scan for the record with `key`
    pub async fn get_by_key(&self, key: &str) -> Option<R> {
        let state = self.state.lock().await;
        state.records.iter().find(|r| r.key() == key).cloned()
    }
}

fn trim<R>(records: &mut VecDeque<R>, capacity: usize) {
    while records.len() > capacity {
        records.pop_front();
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LocationRecord, LogLevel, LogRecord, StatusRecord};
    use crate::devices::DeviceStatus;
    use std::sync::Arc;

    fn status(id: &str, status: DeviceStatus, ts: &str) -> StatusRecord {
        StatusRecord {
            device_id: id.to_string(),
            status,
            timestamp: ts.to_string(),
            alcohol_level: None,
        }
    }

    fn log(n: usize) -> LogRecord {
        LogRecord::new("helmet-001", LogLevel::Info, format!("log {n}"), Some(n.to_string()), None)
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("helmguard-store-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_record_per_device() {
        let store = RecordStore::in_memory(RecordCategory::Status, 1000);

        store.upsert_by_key(status("helmet-001", DeviceStatus::Safe, "t1")).await;
        store.upsert_by_key(status("helmet-002", DeviceStatus::Safe, "t2")).await;
        store.upsert_by_key(status("helmet-001", DeviceStatus::Drunken, "t3")).await;

        assert_eq!(store.len().await, 2);
        let latest = store.get_by_key("helmet-001").await.unwrap();
        assert_eq!(latest.status, DeviceStatus::Drunken);
        assert_eq!(latest.timestamp, "t3");

        // the replaced record moves to the newest position
        let order: Vec<_> = store.get_recent(10).await.into_iter().map(|r| r.device_id).collect();
        assert_eq!(order, vec!["helmet-002", "helmet-001"]);
        assert!(store.get_by_key("helmet-404").await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_trims_after_replacement() {
        let store = RecordStore::in_memory(RecordCategory::Status, 3);
        for id in ["a", "b", "c"] {
            store.upsert_by_key(status(id, DeviceStatus::Safe, "t")).await;
        }
        // replacing an existing key does not evict anything
        store.upsert_by_key(status("a", DeviceStatus::Drunken, "t")).await;
        assert_eq!(store.len().await, 3);

        store.upsert_by_key(status("d", DeviceStatus::Safe, "t")).await;
        let ids: Vec<_> = store.get_recent(10).await.into_iter().map(|r| r.device_id).collect();
        assert_eq!(ids, vec!["c", "a", "d"]);
    }

    #[tokio::test]
    async fn test_retention_cap_keeps_most_recent() {
        let store = RecordStore::in_memory(RecordCategory::Log, 1000);
        for n in 0..1500 {
            store.append(log(n)).await;
        }

        let recent = store.get_recent(1500).await;
        assert_eq!(recent.len(), 1000);
        assert_eq!(recent.first().unwrap().message, "log 500");
        assert_eq!(recent.last().unwrap().message, "log 1499");
    }

    #[tokio::test]
    async fn test_get_recent_where_filters_and_orders() {
        let store = RecordStore::in_memory(RecordCategory::Location, 1000);
        for n in 0..6 {
            let device = if n % 2 == 0 { "helmet-001" } else { "bike-001" };
            store
                .append(LocationRecord {
                    device_id: device.to_string(),
                    latitude: n as f64,
                    longitude: 0.0,
                    timestamp: n.to_string(),
                    ip_location: None,
                })
                .await;
        }

        let bike = store.get_recent_where(2, |r| r.device_id == "bike-001").await;
        let lats: Vec<_> = bike.iter().map(|r| r.latitude).collect();
        assert_eq!(lats, vec![3.0, 5.0]);

        assert_eq!(store.get_recent(0).await.len(), 0);
        assert_eq!(store.get_recent(100).await.len(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_leave_one_intact_record() {
        let store = Arc::new(RecordStore::in_memory(RecordCategory::Status, 1000));

        let handles: Vec<_> = (0..32)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut record = status("helmet-001", DeviceStatus::Drunken, &format!("t{n}"));
                    record.alcohol_level = Some(n);
                    store.upsert_by_key(record).await;
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        assert_eq!(store.len().await, 1);
        let survivor = store.get_by_key("helmet-001").await.unwrap();
        let n = survivor.alcohol_level.unwrap();
        assert!((0..32).contains(&n));
        assert_eq!(survivor.timestamp, format!("t{n}"));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = temp_dir();
        let path = dir.join("status.json");

        let store: RecordStore<StatusRecord> =
            RecordStore::open(RecordCategory::Status, 1000, &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(!store.is_dirty().await);

        store.upsert_by_key(status("helmet-001", DeviceStatus::Drunken, "t1")).await;
        assert!(store.is_dirty().await);
        assert!(store.flush().await.unwrap());
        assert!(!store.flush().await.unwrap());

        let reopened: RecordStore<StatusRecord> =
            RecordStore::open(RecordCategory::Status, 1000, &path).await.unwrap();
        let record = reopened.get_by_key("helmet-001").await.unwrap();
        assert_eq!(record.status, DeviceStatus::Drunken);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_fatal() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();

        let garbage = dir.join("gps.json");
        std::fs::write(&garbage, "{ not json").unwrap();
        let err = RecordStore::<LocationRecord>::open(RecordCategory::Location, 1000, &garbage)
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());

        let unknown_status = dir.join("status.json");
        std::fs::write(
            &unknown_status,
            r#"[{"device_id":"h","status":"sleepy","timestamp":"t"}]"#,
        )
        .unwrap();
        let err = RecordStore::<StatusRecord>::open(RecordCategory::Status, 1000, &unknown_status)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_in_memory_flush_is_noop() {
        let store = RecordStore::in_memory(RecordCategory::Log, 10);
        store.append(log(1)).await;
        assert!(!store.is_dirty().await);
        assert!(!store.flush().await.unwrap());
        assert!(store.snapshot_path().is_none());
    }
}
