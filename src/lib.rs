//! reef-orchestrator - unattended time-lapse imaging
//!
//! Drives a microscope, a robotic arm and an incubator through repeated
//! load → scan → unload cycles for a set of imaging tasks, each with its own
//! plan of time points.
//!
//! # Architecture
//!
//! - The task file is the single source of truth; every state change is
//!   written to it atomically before the next step begins
//! - All sample movement is serialized through one transport queue
//! - Hardware services are health-checked and dispatch is gated on liveness
//! - Shutdown waits for running hardware sequences to finish
//!
//! # Modules
//!
//! - `adapters`: Service proxies (HTTP and simulated)
//! - `core`: Task store, transport, health, guard, scheduler, orchestrator
//! - `domain`: Data structures (Task, SampleSlot, TransportRequest)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run against the lab's service server
//! reef-orchestrator run --mode local
//!
//! # Try a task file without hardware
//! reef-orchestrator run --simulation
//!
//! # Check progress
//! reef-orchestrator status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod logging;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorStatus, TaskStore};
pub use domain::{OperationalState, ScanMode, Task, TaskSettings, TimePoint};
pub use error::{OrchestratorError, TransportError};
