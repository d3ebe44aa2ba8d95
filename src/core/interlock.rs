// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Safety interlock - maps helmet status to bike enable/disable.
//!
//! Everything here is pure; persistence and delivery belong to the engine.

use serde::{Deserialize, Serialize};

use crate::db::{LogLevel, LogRecord, StatusRecord};
use crate::devices::DeviceStatus;
use crate::streaming::StatusEvent;

/// Directed signal sent to the paired bike.
///
/// The wire tokens are what deployed bike firmware understands; never change
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Block,
    Allow,
}

impl Signal {
    pub const BLOCK_TOKEN: &'static str = "304";
    pub const ALLOW_TOKEN: &'static str = "302";

    pub fn token(&self) -> &'static str {
        match self {
            Signal::Block => Self::BLOCK_TOKEN,
            Signal::Allow => Self::ALLOW_TOKEN,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            Self::BLOCK_TOKEN => Some(Signal::Block),
            Self::ALLOW_TOKEN => Some(Signal::Allow),
            _ => None,
        }
    }

    /// Signal pushed on a status report, if any
    pub fn for_status(status: DeviceStatus) -> Option<Self> {
        match status {
            DeviceStatus::Drunken => Some(Signal::Block),
            DeviceStatus::Safe => Some(Signal::Allow),
            DeviceStatus::Unknown | DeviceStatus::Override => None,
        }
    }
}

/// Answer to the bike polling for its helmet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    NotPaired,
    Block,
    Allow,
}

impl Verdict {
    /// Status code the bike webhook has always answered with
    pub fn status_code(&self) -> u16 {
        match self {
            Verdict::NotPaired => 404,
            Verdict::Block => 304,
            Verdict::Allow => 302,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Verdict::NotPaired => "helmet not paired",
            Verdict::Block => "block bike",
            Verdict::Allow => "start bike",
        }
    }
}

/// Everything that follows from one helmet status report
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub record: StatusRecord,
    pub signal: Option<Signal>,
    pub event: StatusEvent,
    pub audit: Option<LogRecord>,
}

/// Derive the record, bike signal, broadcast payload and audit log for a
/// status report.
pub fn on_status_report(
    device_id: &str,
    status: DeviceStatus,
    timestamp: &str,
    alcohol_level: Option<i32>,
) -> Transition {
    let record = StatusRecord {
        device_id: device_id.to_string(),
        status,
        timestamp: timestamp.to_string(),
        alcohol_level,
    };

    let event = StatusEvent {
        device: device_id.to_string(),
        status,
        timestamp: timestamp.to_string(),
    };

    let audit = match status {
        DeviceStatus::Drunken => {
            let level = alcohol_level
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Some(LogRecord::new(
                device_id,
                LogLevel::Security,
                format!("Alcohol detected: {}", level),
                Some(timestamp.to_string()),
                None,
            ))
        }
        DeviceStatus::Safe => Some(LogRecord::new(
            device_id,
            LogLevel::Action,
            "Helmet status: Safe",
            Some(timestamp.to_string()),
            None,
        )),
        _ => None,
    };

    Transition {
        record,
        signal: Signal::for_status(status),
        event,
        audit,
    }
}

/// Decide whether the bike may start given the helmet's latest status
pub fn verdict(latest: Option<&StatusRecord>) -> Verdict {
    match latest.map(|r| r.status) {
        None => Verdict::NotPaired,
        Some(DeviceStatus::Drunken) => Verdict::Block,
        Some(_) => Verdict::Allow,
    }
}
