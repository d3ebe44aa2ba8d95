// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! HelmGuard - helmet/bike safety interlock
//!
//! A smart helmet reports whether its wearer is sober; the paired bike is
//! told to start or stay blocked. Around that sit GPS and log history and a
//! live event feed for dashboards.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HelmGuard Engine                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │
//! │  │ Devices  │→ │ Interlock │→ │ Event Hub │→ │ WebSocket │  │
//! │  │ Registry │  │  Logic    │  │           │  │  Server   │  │
//! │  └──────────┘  └───────────┘  └───────────┘  └───────────┘  │
//! │       ↓             ↓                                       │
//! │  ┌──────────────────────────┐  ┌─────────────────────────┐  │
//! │  │ Record Stores (status,   │  │ Log Pipeline → journal  │  │
//! │  │ location snapshots)      │  │                         │  │
//! │  └──────────────────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod alerts;
pub mod config;
pub mod core;
pub mod db;
pub mod devices;
pub mod error;
pub mod pipeline;
pub mod streaming;

// Re-exports for convenience
pub use config::Config;
pub use core::{Engine, Signal, Verdict};
pub use db::{LocationRecord, LogLevel, LogRecord, RecordStore, StatusRecord};
pub use devices::{DeviceKind, DeviceRegistry, DeviceStatus};
pub use pipeline::LogPipeline;
pub use streaming::{EventHub, WebSocketServer};

/// HelmGuard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// HelmGuard name
pub const NAME: &str = "HelmGuard";
