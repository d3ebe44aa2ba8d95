// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Error types shared across subsystems

use std::path::PathBuf;
use thiserror::Error;

/// Record store and log sink failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure while reading or writing backing state
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Backing state exists but cannot be decoded. Fatal at startup.
    #[error("corrupt backing state in {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be encoded for persistence
    #[error("failed to encode records: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// True for errors that must abort initialization
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Delivery failure on a single connection
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(String),

    /// The peer stopped draining its outbound queue
    #[error("connection {0} is not keeping up")]
    Backlogged(String),
}

/// Failures of the external alerting collaborators (SMS, geolocation)
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}
