//! Core orchestration logic.
//!
//! This module contains:
//! - TaskStore: the persisted task document
//! - TransportQueue: serialized sample movement
//! - HealthMonitor: service liveness
//! - CriticalSectionGuard: shutdown-safe hardware sequences
//! - DispatchHalt: store writes that failed and stop dispatch
//! - Scheduler: due time points to imaging cycles
//! - Orchestrator: wiring, status and shutdown

pub mod guard;
pub mod halt;
pub mod health;
pub mod imaging;
pub mod orchestrator;
pub mod scheduler;
pub mod task_store;
pub mod transport;
pub mod watcher;

// Re-export commonly used types
pub use guard::{ClearanceReport, CriticalSectionGuard, ForcedSection, SectionInfo, SectionToken};
pub use halt::{DispatchHalt, StoreOp};
pub use health::{HealthMonitor, ServiceEvent, ServiceTable};
pub use imaging::ScanPolicy;
pub use orchestrator::{Orchestrator, OrchestratorStatus, ShutdownReport, TaskStatus};
pub use scheduler::{Scheduler, TickReport};
pub use task_store::{TaskDocument, TaskStore};
pub use transport::{TransportQueue, TransportStatus, TransportTicket, TransportWorker, WorkerState};
pub use watcher::{watch_task_file, WatchHandle};
