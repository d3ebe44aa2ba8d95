// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Durable destinations for flushed log batches

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::{write_atomic, LogRecord};
use crate::error::StoreError;

/// Bytes read per step when scanning a journal backwards
const TAIL_CHUNK: u64 = 64 * 1024;

/// Receives each flushed batch as one unit
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, batch: &[LogRecord]) -> Result<(), StoreError>;
}

/// JSON-lines journal holding at most `capacity` entries.
///
/// Batches are appended while they fit; a batch that would overflow the cap
/// rewrites the journal with the newest entries only.
pub struct JsonlSink {
    path: PathBuf,
    capacity: usize,
    lines: Mutex<usize>,
}

impl JsonlSink {
    /// Open the journal, compacting it first if it holds more than `capacity`
    /// lines
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let capacity = capacity.max(1);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let tail = read_tail(&path, capacity).await?;
        if tail.truncated {
            write_atomic(&path, &join_lines(&tail.lines)).await?;
            info!("Compacted log journal {:?} to {} lines", path, tail.lines.len());
        }

        info!("Log journal at {:?}", path);
        Ok(Self {
            path,
            capacity,
            lines: Mutex::new(tail.lines.len()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last `limit` journal entries, oldest first.
    ///
    /// Only the end of the file is read. A missing journal is empty; any
    /// undecodable line in the tail is fatal.
    pub async fn load_tail(&self, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        let tail = read_tail(&self.path, limit).await?;
        tail.lines
            .iter()
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }

    async fn append(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(bytes).await.map_err(|e| StoreError::io(&self.path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl LogSink for JsonlSink {
    async fn write_batch(&self, batch: &[LogRecord]) -> Result<(), StoreError> {
        let skip = batch.len().saturating_sub(self.capacity);
        let incoming = &batch[skip..];

        let mut buf = Vec::with_capacity(incoming.len() * 128);
        for record in incoming {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut lines = self.lines.lock().await;
        if *lines + incoming.len() <= self.capacity {
            self.append(&buf).await?;
            *lines += incoming.len();
            debug!("Appended {} log lines to {:?}", incoming.len(), self.path);
            return Ok(());
        }

        let keep = self.capacity - incoming.len();
        let kept = if keep == 0 {
            Vec::new()
        } else {
            read_tail(&self.path, keep).await?.lines
        };

        let mut bytes = join_lines(&kept);
        bytes.extend_from_slice(&buf);
        write_atomic(&self.path, &bytes).await?;
        *lines = kept.len() + incoming.len();

        debug!("Rewrote log journal {:?} with {} lines", self.path, *lines);
        Ok(())
    }
}

struct Tail {
    lines: Vec<String>,
    /// The file held more than the returned lines
    truncated: bool,
}

/// Read the last `limit` non-empty lines of `path` by scanning backwards
async fn read_tail(path: &Path, limit: usize) -> Result<Tail, StoreError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Tail { lines: Vec::new(), truncated: false });
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let len = file.metadata().await.map_err(|e| StoreError::io(path, e))?.len();

    let mut start = len;
    let mut buf: Vec<u8> = Vec::new();
    // enough once `limit` whole lines and the newline before them are buffered
    while start > 0 && count_newlines(&buf) <= limit {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    if start > 0 {
        let cut = buf.iter().position(|b| *b == b'\n').map_or(buf.len(), |i| i + 1);
        buf.drain(..cut);
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    let excess = lines.len().saturating_sub(limit);
    lines.drain(..excess);

    Ok(Tail { lines, truncated: start > 0 || excess > 0 })
}

fn count_newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }
    bytes
}

/// Discards batches; used when no journal is configured
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn write_batch(&self, _batch: &[LogRecord]) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LogLevel;

    #[tokio::test]
    async fn test_journal_append_and_tail() {
        let dir = std::env::temp_dir().join(format!("helmguard-sink-{}", uuid::Uuid::new_v4()));
        let sink = JsonlSink::open(dir.join("logs.jsonl"), 100).await.unwrap();
        assert!(sink.load_tail(10).await.unwrap().is_empty());

        let batch: Vec<_> = (0..5)
            .map(|n| LogRecord::new("helmet-001", LogLevel::Info, format!("m{n}"), None, None))
            .collect();
        sink.write_batch(&batch[..3]).await.unwrap();
        sink.write_batch(&batch[3..]).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 5);

        let tail = sink.load_tail(2).await.unwrap();
        assert_eq!(tail, batch[3..].to_vec());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_malformed_journal_line_is_fatal() {
        let dir = std::env::temp_dir().join(format!("helmguard-sink-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("logs.jsonl"), "{\"broken\":\n").unwrap();

        let sink = JsonlSink::open(dir.join("logs.jsonl"), 100).await.unwrap();
        let err = sink.load_tail(10).await.unwrap_err();
        assert!(err.is_fatal());

        let _ = std::fs::remove_dir_all(dir);
    }

    fn records(prefix: &str, count: usize) -> Vec<LogRecord> {
        (0..count)
            .map(|n| {
                LogRecord::new("helmet-001", LogLevel::Info, format!("{prefix}{n}"), Some("t".into()), None)
            })
            .collect()
    }

    fn journal_messages(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<LogRecord>(l).unwrap().message)
            .collect()
    }

    #[tokio::test]
    async fn test_journal_never_exceeds_capacity() {
        let dir = std::env::temp_dir().join(format!("helmguard-sink-{}", uuid::Uuid::new_v4()));
        let sink = JsonlSink::open(dir.join("logs.jsonl"), 5).await.unwrap();

        let batch = records("m", 9);
        sink.write_batch(&batch[..3]).await.unwrap();
        sink.write_batch(&batch[3..6]).await.unwrap();
        assert_eq!(journal_messages(sink.path()), vec!["m1", "m2", "m3", "m4", "m5"]);

        sink.write_batch(&batch[6..]).await.unwrap();
        assert_eq!(journal_messages(sink.path()), vec!["m4", "m5", "m6", "m7", "m8"]);

        // a batch larger than the cap keeps its newest entries
        sink.write_batch(&records("big", 7)).await.unwrap();
        assert_eq!(
            journal_messages(sink.path()),
            vec!["big2", "big3", "big4", "big5", "big6"]
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_open_compacts_oversized_journal() {
        let dir = std::env::temp_dir().join(format!("helmguard-sink-{}", uuid::Uuid::new_v4()));
        let path = dir.join("logs.jsonl");
        let unbounded = JsonlSink::open(&path, 10_000).await.unwrap();
        unbounded.write_batch(&records("m", 20)).await.unwrap();

        let sink = JsonlSink::open(&path, 5).await.unwrap();
        assert_eq!(journal_messages(&path), vec!["m15", "m16", "m17", "m18", "m19"]);

        sink.write_batch(&records("n", 1)).await.unwrap();
        assert_eq!(journal_messages(&path).len(), 5);
        assert_eq!(journal_messages(&path)[4], "n0");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_tail_read_spans_chunks() {
        let dir = std::env::temp_dir().join(format!("helmguard-sink-{}", uuid::Uuid::new_v4()));
        let path = dir.join("logs.jsonl");
        let sink = JsonlSink::open(&path, 5_000).await.unwrap();
        sink.write_batch(&records("m", 3_000)).await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 2 * TAIL_CHUNK);

        let tail = sink.load_tail(1_500).await.unwrap();
        assert_eq!(tail.len(), 1_500);
        assert_eq!(tail[0].message, "m1500");
        assert_eq!(tail[1_499].message, "m2999");

        let _ = std::fs::remove_dir_all(dir);
    }
}
