//! Dispatch halt shared by everything that writes the task store.
//!
//! A write that fails with a halting error is queued here and dispatch stops.
//! The scheduler replays the queue on every tick and resumes once all of it
//! has been written and the task file reads back cleanly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::core::task_store::TaskStore;
use crate::domain::{OperationalState, SampleLocation, TimePoint};
use crate::error::{OrchestratorError, Result};

/// A task store update that could not be written yet
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    MarkImaged { task: String, time_point: TimePoint },
    Advance { task: String, to: OperationalState },
    SetError { task: String, message: String },
    RecordSlot { slot_id: u8, location: SampleLocation },
}

impl StoreOp {
    pub async fn apply(&self, store: &TaskStore) -> Result<()> {
        match self {
            Self::MarkImaged { task, time_point } => {
                store.mark_imaged(task, *time_point).await.map(|_| ())
            }
            Self::Advance { task, to } => store.advance_state(task, *to).await,
            Self::SetError { task, message } => store.set_error(task, message.clone()).await,
            Self::RecordSlot { slot_id, location } => {
                store.record_slot_location(*slot_id, *location).await
            }
        }
    }
}

#[derive(Debug, Default)]
struct HaltState {
    reason: Option<String>,
    deferred: VecDeque<StoreOp>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchHalt {
    state: Arc<Mutex<HaltState>>,
}

impl DispatchHalt {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HaltState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reason dispatch is halted, if it is
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.lock().reason.is_some()
    }

    /// Stop dispatch because of `err`, keeping `op` for a later retry
    pub fn enter(&self, err: &OrchestratorError, op: Option<StoreOp>) {
        let mut halt = self.lock();
        if halt.reason.is_none() {
            error!(error = %err, "Dispatch halted");
        }
        halt.reason = Some(err.to_string());
        if let Some(op) = op {
            halt.deferred.push_back(op);
        }
    }

    /// Number of updates waiting to be written
    pub fn deferred(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Retry deferred updates in order. Returns true once dispatch may resume.
    pub async fn try_resume(&self, store: &TaskStore) -> bool {
        if !self.is_halted() {
            return true;
        }

        loop {
            let next = self.lock().deferred.front().cloned();
            let Some(op) = next else { break };

            match op.apply(store).await {
                Ok(()) => {}
                Err(e) if e.halts_dispatch() => {
                    self.lock().reason = Some(e.to_string());
                    return false;
                }
                Err(e) => warn!(error = %e, ?op, "Dropping deferred update that no longer applies"),
            }
            self.lock().deferred.pop_front();
        }

        // Nothing left to write; make sure the file on disk is readable again
        if let Err(e) = store.reload().await {
            if e.halts_dispatch() {
                self.lock().reason = Some(e.to_string());
                return false;
            }
        }

        let mut halt = self.lock();
        if !halt.deferred.is_empty() {
            // Another writer failed while we were replaying
            return false;
        }
        halt.reason = None;
        info!("Task store writable again; dispatch resumed");
        true
    }
}
