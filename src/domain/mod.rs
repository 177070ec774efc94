//! Domain types for the imaging orchestrator.
//!
//! - `task`: imaging tasks, their time points and settings
//! - `slot`: incubator sample slots and sample locations
//! - `transport`: load/unload requests for the transport queue
//! - `service`: health handles for the proxied hardware services

pub mod service;
pub mod slot;
pub mod task;
pub mod transport;

pub use service::{Connection, ServiceHandle, ServiceKind};
pub use slot::{Occupancy, SampleLocation, SampleSlot, SlotReport, MAX_SLOT_ID};
pub use task::{
    IlluminationChannel, ImagingParameters, OperationalState, ScanMode, StagePosition, Task,
    TaskSettings, TimePoint,
};
pub use transport::{TransportKind, TransportOutcome, TransportRequest};
