// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Database module - bounded record history

mod records;
mod store;

pub use records::*;
pub use store::RecordStore;
pub(crate) use store::write_atomic;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Record categories, one store each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordCategory {
    Status,
    Log,
    Location,
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordCategory::Status => "status",
            RecordCategory::Log => "log",
            RecordCategory::Location => "location",
        })
    }
}
