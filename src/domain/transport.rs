//! Transport requests handled by the transport queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::slot::SampleLocation;

/// Direction of a sample movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Incubator slot → microscope stage
    Load,
    /// Microscope stage → incubator slot
    Unload,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => f.write_str("load"),
            Self::Unload => f.write_str("unload"),
        }
    }
}

/// A single physical movement, consumed exactly once by the transport worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportRequest {
    pub id: Uuid,
    pub kind: TransportKind,
    pub slot_id: u8,
    /// Microscope service the sample moves to or from
    pub microscope: String,
    pub issued_at: DateTime<Utc>,
    /// Task that owns the sample, for logging and critical-section tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl TransportRequest {
    pub fn new(kind: TransportKind, slot_id: u8, microscope: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            slot_id,
            microscope: microscope.into(),
            issued_at: Utc::now(),
            task: None,
        }
    }

    pub fn load(slot_id: u8, microscope: impl Into<String>) -> Self {
        Self::new(TransportKind::Load, slot_id, microscope)
    }

    pub fn unload(slot_id: u8, microscope: impl Into<String>) -> Self {
        Self::new(TransportKind::Unload, slot_id, microscope)
    }

    /// Attach the owning task
    pub fn for_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

/// Result of a completed transport request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportOutcome {
    pub request_id: Uuid,
    pub kind: TransportKind,
    pub slot_id: u8,
    /// Where the sample ended up
    pub final_location: SampleLocation,
    /// True if nothing had to move (e.g. unload of a plate already in its slot)
    pub skipped: bool,
    /// False if the new location could not be written to the task file
    pub location_recorded: bool,
    pub duration_ms: u64,
}
