//! Error taxonomy for the orchestrator core.
//!
//! Hardware and transport failures are contained at the task level: they set
//! the owning task to `error` and never stop the scheduler. Persistence
//! failures halt dispatch until the task file can be written again.

use std::time::Duration;

use thiserror::Error;

use crate::domain::{OperationalState, TimePoint, TransportKind};

/// Result alias for core operations
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or missing task file
    #[error("ConfigError: {0}")]
    Config(String),

    #[error("TransportError: {0}")]
    Transport(#[from] TransportError),

    #[error("ImagingError: task '{task}': {reason}")]
    Imaging { task: String, reason: String },

    /// A required service is unreachable; dispatch is deferred
    #[error("ServiceUnavailable: {service}")]
    ServiceUnavailable { service: String },

    #[error("InvalidTransition: task '{task}' cannot go from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: OperationalState,
        to: OperationalState,
    },

    /// A hardware section outlived its hard bound and was force-closed
    #[error("CriticalSectionTimeout: '{label}' still running after {elapsed:?}")]
    CriticalSectionTimeout {
        label: String,
        task: Option<String>,
        elapsed: Duration,
    },

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("time point {time_point} is not pending for task '{task}'")]
    TimePointNotPending { task: String, time_point: TimePoint },

    /// Task file could not be written; dispatch halts
    #[error("PersistenceError: {0}")]
    Persistence(String),

    /// Shutdown has been requested; no new hardware sequence may begin
    #[error("shutdown pending")]
    ShutdownPending,
}

impl OrchestratorError {
    /// Errors after which the scheduler must stop dispatching
    pub fn halts_dispatch(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Config(_))
    }
}

/// A physical sample movement failed or timed out
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} of slot {slot_id} failed: {reason}")]
pub struct TransportError {
    pub kind: TransportKind,
    pub slot_id: u8,
    pub reason: String,
}

impl TransportError {
    pub fn new(kind: TransportKind, slot_id: u8, reason: impl Into<String>) -> Self {
        Self {
            kind,
            slot_id,
            reason: reason.into(),
        }
    }
}
