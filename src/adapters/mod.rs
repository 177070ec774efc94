//! Typed proxies for the remote hardware services.
//!
//! Each hardware class exposes a fixed capability trait. Implementations:
//! - `http`: JSON calls to the service endpoints of a service server
//! - `simulated`: in-process mocks with identical contracts

pub mod http;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{IlluminationChannel, SampleLocation, ServiceKind, SlotReport, StagePosition};

pub use http::{HttpConnector, HttpServiceClient};
pub use simulated::SimulatedLab;

/// Reply expected from a healthy service's `ping`
pub const PONG: &str = "pong";

/// Failure of a single service call.
///
/// `Transport` is a network-level failure; `Rejected` is the service
/// answering with a failure status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceCallError {
    #[error("{service}: transport failure: {message}")]
    Transport { service: String, message: String },

    #[error("{service}: rejected: {message}")]
    Rejected { service: String, message: String },

    #[error("{service}: no reply within {after:?}")]
    Timeout { service: String, after: Duration },
}

pub type CallResult<T> = std::result::Result<T, ServiceCallError>;

/// Operations every service exposes
#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// Service id on the service server
    fn service_id(&self) -> &str;

    /// Liveness probe; a healthy service answers [`PONG`]
    async fn ping(&self) -> CallResult<String>;

    /// Structured health/task info
    async fn get_status(&self) -> CallResult<serde_json::Value>;
}

/// Sample incubator with a transfer station
#[async_trait]
pub trait Incubator: ServiceProxy {
    async fn get_sample_from_slot_to_transfer_station(&self, slot: u8) -> CallResult<()>;
    async fn put_sample_from_transfer_station_to_slot(&self, slot: u8) -> CallResult<()>;
    async fn update_sample_location(&self, slot: u8, location: SampleLocation) -> CallResult<()>;
    async fn get_sample_location(&self, slot: u8) -> CallResult<SampleLocation>;
    async fn get_well_plate_type(&self, slot: u8) -> CallResult<String>;
    async fn get_slot_information(&self) -> CallResult<Vec<SlotReport>>;
}

/// Robotic arm moving plates between the incubator station and microscopes
#[async_trait]
pub trait RoboticArm: ServiceProxy {
    async fn incubator_to_microscope(&self, station: u8) -> CallResult<()>;
    async fn microscope_to_incubator(&self, station: u8) -> CallResult<()>;
}

/// Microscope with a motorized stage and a long-running scan
#[async_trait]
pub trait Microscope: ServiceProxy {
    async fn home_stage(&self) -> CallResult<()>;
    async fn return_stage(&self) -> CallResult<()>;
    /// Start a scan; returns the service's acknowledgement
    async fn scan_start(&self, request: &ScanRequest) -> CallResult<serde_json::Value>;
    async fn scan_get_status(&self) -> CallResult<ScanStatus>;
}

/// Scan configuration sent to `scan_start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub saved_data_type: String,
    pub well_plate_type: String,
    pub illumination_settings: Vec<IlluminationChannel>,
    pub do_contrast_autofocus: bool,
    pub do_reflection_af: bool,
    pub scanning_zone: Vec<[u32; 2]>,
    #[serde(rename = "Nx")]
    pub nx: u32,
    #[serde(rename = "Ny")]
    pub ny: u32,
    pub dx: f64,
    pub dy: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wells_to_scan: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<StagePosition>,
    #[serde(rename = "action_ID")]
    pub action_id: String,
}

/// Scan progress reported by `scan_get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    #[serde(rename = "status")]
    pub state: ScanState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_well: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

/// A live proxy for one service, typed by hardware class
#[derive(Clone)]
pub enum ProxyRef {
    Incubator(Arc<dyn Incubator>),
    RoboticArm(Arc<dyn RoboticArm>),
    Microscope(Arc<dyn Microscope>),
}

impl ProxyRef {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Incubator(_) => ServiceKind::Incubator,
            Self::RoboticArm(_) => ServiceKind::RoboticArm,
            Self::Microscope(_) => ServiceKind::Microscope,
        }
    }

    pub async fn ping(&self) -> CallResult<String> {
        match self {
            Self::Incubator(p) => p.ping().await,
            Self::RoboticArm(p) => p.ping().await,
            Self::Microscope(p) => p.ping().await,
        }
    }

    pub async fn get_status(&self) -> CallResult<serde_json::Value> {
        match self {
            Self::Incubator(p) => p.get_status().await,
            Self::RoboticArm(p) => p.get_status().await,
            Self::Microscope(p) => p.get_status().await,
        }
    }

    pub fn as_incubator(&self) -> Option<Arc<dyn Incubator>> {
        match self {
            Self::Incubator(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    pub fn as_robotic_arm(&self) -> Option<Arc<dyn RoboticArm>> {
        match self {
            Self::RoboticArm(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    pub fn as_microscope(&self) -> Option<Arc<dyn Microscope>> {
        match self {
            Self::Microscope(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ProxyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProxyRef({})", self.kind())
    }
}

/// Establishes (or re-establishes) proxies for named services
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    async fn connect(&self, kind: ServiceKind, service_id: &str) -> CallResult<ProxyRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_status_parsing() {
        let status: ScanStatus = serde_json::from_str(
            r#"{"status": "running", "progress": 42.0, "current_well": "B3"}"#,
        )
        .unwrap();
        assert_eq!(status.state, ScanState::Running);
        assert_eq!(status.current_well.as_deref(), Some("B3"));

        let status: ScanStatus = serde_json::from_str(r#"{"status": "paused"}"#).unwrap();
        assert_eq!(status.state, ScanState::Unknown);
    }

    #[test]
    fn test_scan_request_wire_names() {
        let request = ScanRequest {
            saved_data_type: "raw_images_well_plate".into(),
            well_plate_type: "96".into(),
            illumination_settings: vec![],
            do_contrast_autofocus: false,
            do_reflection_af: true,
            scanning_zone: vec![[0, 0], [1, 1]],
            nx: 3,
            ny: 3,
            dx: 0.8,
            dy: 0.8,
            wells_to_scan: vec![],
            positions: vec![],
            action_id: "exp1".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["Nx"], 3);
        assert_eq!(json["action_ID"], "exp1");
        assert!(json.get("positions").is_none());
    }
}
