// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Core engine module - orchestrates state, history and fan-out

mod engine;
pub mod interlock;

pub use engine::{DashboardSnapshot, Engine, EngineBuilder, StatusQuery};
pub use interlock::{Signal, Transition, Verdict};

use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineStats;

/// System-wide state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub running: bool,
    pub uptime_seconds: u64,
    pub devices: usize,
    pub observers: usize,
    pub directed_connections: usize,
    pub events_published: u64,
    pub status_records: usize,
    pub location_records: usize,
    pub pipeline: PipelineStats,
}
