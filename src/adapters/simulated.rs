//! Simulated lab hardware.
//!
//! `SimulatedLab` holds the shared state of one incubator, one arm and any
//! number of microscopes, and hands out proxies with the same contracts as the
//! HTTP ones. Every call is appended to an operation log and can be made to
//! fail, hang or run slowly, which is how the scheduler and transport tests
//! drive failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::{
    CallResult, Incubator, Microscope, ProxyRef, RoboticArm, ScanRequest, ScanState, ScanStatus,
    ServiceCallError, ServiceConnector, ServiceProxy, PONG,
};
use crate::domain::{SampleLocation, ServiceKind, SlotReport};

/// Injected behaviour for one operation name
#[derive(Debug, Clone)]
enum Fault {
    Fail { message: String, once: bool },
    Hang,
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct SimSlot {
    sample_name: String,
    location: SampleLocation,
}

#[derive(Debug)]
struct LabState {
    unreachable: HashMap<String, bool>,
    slots: BTreeMap<u8, SimSlot>,
    operations: Vec<String>,
    faults: HashMap<String, Fault>,
    call_delay: Duration,
    plate_type: String,
    scan_polls: u32,
    scan_polls_left: Option<u32>,
    scan_failure: Option<String>,
}

/// What a call should do once the state lock is released
enum Action {
    Proceed,
    Fail(ServiceCallError),
    Hang,
    Sleep(Duration),
}

/// Shared simulated hardware. Cloning shares the same lab.
#[derive(Debug, Clone)]
pub struct SimulatedLab {
    state: Arc<Mutex<LabState>>,
}

impl SimulatedLab {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LabState {
                unreachable: HashMap::new(),
                slots: BTreeMap::new(),
                operations: Vec::new(),
                faults: HashMap::new(),
                call_delay: Duration::ZERO,
                plate_type: "96".to_string(),
                scan_polls: 1,
                scan_polls_left: None,
                scan_failure: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LabState> {
        // A panic while holding the lock only happens in a failing test; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place a plate in `slot`
    pub fn with_sample(self, slot: u8, name: impl Into<String>) -> Self {
        self.lock().slots.insert(
            slot,
            SimSlot {
                sample_name: name.into(),
                location: SampleLocation::IncubatorSlot,
            },
        );
        self
    }

    /// Latency added to every call
    pub fn with_call_delay(self, delay: Duration) -> Self {
        self.lock().call_delay = delay;
        self
    }

    /// Make every call to `op` fail with `message`
    pub fn fail(&self, op: &str, message: impl Into<String>) {
        self.lock().faults.insert(
            op.to_string(),
            Fault::Fail {
                message: message.into(),
                once: false,
            },
        );
    }

    /// Make the next call to `op` fail with `message`
    pub fn fail_once(&self, op: &str, message: impl Into<String>) {
        self.lock().faults.insert(
            op.to_string(),
            Fault::Fail {
                message: message.into(),
                once: true,
            },
        );
    }

    /// Make calls to `op` never return
    pub fn hang(&self, op: &str) {
        self.lock().faults.insert(op.to_string(), Fault::Hang);
    }

    /// Make calls to `op` take `delay`
    pub fn delay(&self, op: &str, delay: Duration) {
        self.lock().faults.insert(op.to_string(), Fault::Delay(delay));
    }

    pub fn clear_fault(&self, op: &str) {
        self.lock().faults.remove(op);
    }

    /// Take a service off the network (or bring it back)
    pub fn set_reachable(&self, service_id: &str, reachable: bool) {
        self.lock()
            .unreachable
            .insert(service_id.to_string(), !reachable);
    }

    /// Number of `running` status replies before a scan completes
    pub fn set_scan_polls(&self, polls: u32) {
        self.lock().scan_polls = polls;
    }

    /// Make the next scans report `failed`
    pub fn fail_scan(&self, message: impl Into<String>) {
        self.lock().scan_failure = Some(message.into());
    }

    pub fn set_plate_type(&self, plate_type: impl Into<String>) {
        self.lock().plate_type = plate_type.into();
    }

    /// Every call made so far, as `service.op(args)`
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    /// Calls whose operation name is `op`
    pub fn count(&self, op: &str) -> usize {
        let needle = format!(".{}(", op);
        self.lock()
            .operations
            .iter()
            .filter(|entry| entry.contains(&needle))
            .count()
    }

    /// Where the plate from `slot` currently is
    pub fn sample_location(&self, slot: u8) -> Option<SampleLocation> {
        self.lock().slots.get(&slot).map(|s| s.location)
    }

    fn is_reachable(&self, service_id: &str) -> bool {
        !self
            .lock()
            .unreachable
            .get(service_id)
            .copied()
            .unwrap_or(false)
    }

    /// Record a call and apply faults. Never holds the lock across an await.
    async fn invoke(&self, service_id: &str, op: &str, args: String) -> CallResult<()> {
        let (action, call_delay) = {
            let mut state = self.lock();
            if state.unreachable.get(service_id).copied().unwrap_or(false) {
                return Err(ServiceCallError::Transport {
                    service: service_id.to_string(),
                    message: "connection refused".to_string(),
                });
            }

            state
                .operations
                .push(format!("{}.{}({})", service_id, op, args));

            let action = match state.faults.get(op).cloned() {
                None => Action::Proceed,
                Some(Fault::Fail { message, once }) => {
                    if once {
                        state.faults.remove(op);
                    }
                    Action::Fail(ServiceCallError::Rejected {
                        service: service_id.to_string(),
                        message,
                    })
                }
                Some(Fault::Hang) => Action::Hang,
                Some(Fault::Delay(d)) => Action::Sleep(d),
            };
            (action, state.call_delay)
        };

        if !call_delay.is_zero() {
            sleep(call_delay).await;
        }

        match action {
            Action::Proceed => Ok(()),
            Action::Fail(err) => Err(err),
            Action::Hang => std::future::pending().await,
            Action::Sleep(d) => {
                sleep(d).await;
                Ok(())
            }
        }
    }

    fn set_location(&self, slot: u8, location: SampleLocation) {
        if let Some(entry) = self.lock().slots.get_mut(&slot) {
            entry.location = location;
        }
    }

    fn proxy_for(&self, kind: ServiceKind, service_id: &str) -> ProxyRef {
        let id = service_id.to_string();
        match kind {
            ServiceKind::Incubator => ProxyRef::Incubator(Arc::new(SimIncubator {
                id,
                lab: self.clone(),
            })),
            ServiceKind::RoboticArm => ProxyRef::RoboticArm(Arc::new(SimArm {
                id,
                lab: self.clone(),
            })),
            ServiceKind::Microscope => ProxyRef::Microscope(Arc::new(SimMicroscope {
                id,
                lab: self.clone(),
            })),
        }
    }
}

impl Default for SimulatedLab {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceConnector for SimulatedLab {
    async fn connect(&self, kind: ServiceKind, service_id: &str) -> CallResult<ProxyRef> {
        if !self.is_reachable(service_id) {
            return Err(ServiceCallError::Transport {
                service: service_id.to_string(),
                message: "service not registered".to_string(),
            });
        }
        Ok(self.proxy_for(kind, service_id))
    }
}

macro_rules! sim_service_proxy {
    ($ty:ident) => {
        #[async_trait]
        impl ServiceProxy for $ty {
            fn service_id(&self) -> &str {
                &self.id
            }

            async fn ping(&self) -> CallResult<String> {
                self.lab.invoke(&self.id, "ping", String::new()).await?;
                Ok(PONG.to_string())
            }

            async fn get_status(&self) -> CallResult<Value> {
                self.lab.invoke(&self.id, "get_status", String::new()).await?;
                Ok(json!({ "service": self.id, "status": "ok" }))
            }
        }
    };
}

struct SimIncubator {
    id: String,
    lab: SimulatedLab,
}

struct SimArm {
    id: String,
    lab: SimulatedLab,
}

struct SimMicroscope {
    id: String,
    lab: SimulatedLab,
}

sim_service_proxy!(SimIncubator);
sim_service_proxy!(SimArm);
sim_service_proxy!(SimMicroscope);

#[async_trait]
impl Incubator for SimIncubator {
    async fn get_sample_from_slot_to_transfer_station(&self, slot: u8) -> CallResult<()> {
        self.lab
            .invoke(&self.id, "get_sample_from_slot_to_transfer_station", slot.to_string())
            .await?;
        if self.lab.sample_location(slot).is_none() {
            return Err(ServiceCallError::Rejected {
                service: self.id.clone(),
                message: format!("slot {} is empty", slot),
            });
        }
        self.lab.set_location(slot, SampleLocation::IncubatorStation);
        Ok(())
    }

    async fn put_sample_from_transfer_station_to_slot(&self, slot: u8) -> CallResult<()> {
        self.lab
            .invoke(&self.id, "put_sample_from_transfer_station_to_slot", slot.to_string())
            .await?;
        self.lab.set_location(slot, SampleLocation::IncubatorSlot);
        Ok(())
    }

    async fn update_sample_location(&self, slot: u8, location: SampleLocation) -> CallResult<()> {
        self.lab
            .invoke(
                &self.id,
                "update_sample_location",
                format!("{}, {}", slot, location),
            )
            .await?;
        self.lab.set_location(slot, location);
        Ok(())
    }

    async fn get_sample_location(&self, slot: u8) -> CallResult<SampleLocation> {
        self.lab
            .invoke(&self.id, "get_sample_location", slot.to_string())
            .await?;
        Ok(self
            .lab
            .sample_location(slot)
            .unwrap_or(SampleLocation::Unknown))
    }

    async fn get_well_plate_type(&self, slot: u8) -> CallResult<String> {
        self.lab
            .invoke(&self.id, "get_well_plate_type", slot.to_string())
            .await?;
        Ok(self.lab.lock().plate_type.clone())
    }

    async fn get_slot_information(&self) -> CallResult<Vec<SlotReport>> {
        self.lab
            .invoke(&self.id, "get_slot_information", String::new())
            .await?;
        Ok(self
            .lab
            .lock()
            .slots
            .iter()
            .map(|(slot_id, slot)| SlotReport {
                slot_id: *slot_id,
                occupied: true,
                sample_name: Some(slot.sample_name.clone()),
                location: slot.location,
            })
            .collect())
    }
}

#[async_trait]
impl RoboticArm for SimArm {
    async fn incubator_to_microscope(&self, station: u8) -> CallResult<()> {
        self.lab
            .invoke(&self.id, "incubator_to_microscope", station.to_string())
            .await
    }

    async fn microscope_to_incubator(&self, station: u8) -> CallResult<()> {
        self.lab
            .invoke(&self.id, "microscope_to_incubator", station.to_string())
            .await
    }
}

#[async_trait]
impl Microscope for SimMicroscope {
    async fn home_stage(&self) -> CallResult<()> {
        self.lab.invoke(&self.id, "home_stage", String::new()).await
    }

    async fn return_stage(&self) -> CallResult<()> {
        self.lab.invoke(&self.id, "return_stage", String::new()).await
    }

    async fn scan_start(&self, request: &ScanRequest) -> CallResult<Value> {
        self.lab
            .invoke(&self.id, "scan_start", request.action_id.clone())
            .await?;
        let mut state = self.lab.lock();
        state.scan_polls_left = Some(state.scan_polls);
        Ok(json!({ "success": true, "action_ID": request.action_id }))
    }

    async fn scan_get_status(&self) -> CallResult<ScanStatus> {
        self.lab
            .invoke(&self.id, "scan_get_status", String::new())
            .await?;

        let mut state = self.lab.lock();
        let failure = state.scan_failure.clone();
        let (scan_state, error) = match (state.scan_polls_left, failure) {
            (None, _) => (ScanState::Idle, None),
            (Some(_), Some(message)) => {
                state.scan_polls_left = None;
                (ScanState::Failed, Some(message))
            }
            (Some(0), None) => {
                state.scan_polls_left = None;
                (ScanState::Completed, None)
            }
            (Some(n), None) => {
                state.scan_polls_left = Some(n - 1);
                (ScanState::Running, None)
            }
        };

        Ok(ScanStatus {
            state: scan_state,
            progress: if scan_state == ScanState::Completed { 100.0 } else { 0.0 },
            current_well: None,
            message: None,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn incubator(lab: &SimulatedLab) -> Arc<dyn Incubator> {
        lab.connect(ServiceKind::Incubator, "incubator-control")
            .await
            .unwrap()
            .as_incubator()
            .unwrap()
    }

    #[tokio::test]
    async fn test_slot_movement_is_tracked() {
        let lab = SimulatedLab::new().with_sample(3, "plate-a");
        let incubator = incubator(&lab).await;

        incubator
            .get_sample_from_slot_to_transfer_station(3)
            .await
            .unwrap();
        assert_eq!(lab.sample_location(3), Some(SampleLocation::IncubatorStation));

        incubator
            .update_sample_location(3, SampleLocation::Microscope(1))
            .await
            .unwrap();
        assert_eq!(
            incubator.get_sample_location(3).await.unwrap(),
            SampleLocation::Microscope(1)
        );

        assert_eq!(
            lab.operations()[1],
            "incubator-control.update_sample_location(3, microscope1)"
        );
    }

    #[tokio::test]
    async fn test_empty_slot_is_rejected() {
        let lab = SimulatedLab::new();
        let err = incubator(&lab)
            .await
            .get_sample_from_slot_to_transfer_station(9)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceCallError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_fail_once_clears_itself() {
        let lab = SimulatedLab::new();
        let incubator = incubator(&lab).await;
        lab.fail_once("ping", "busy");

        assert!(incubator.ping().await.is_err());
        assert_eq!(incubator.ping().await.unwrap(), PONG);
        assert_eq!(lab.count("ping"), 2);
    }

    #[tokio::test]
    async fn test_hang_never_resolves() {
        let lab = SimulatedLab::new();
        let incubator = incubator(&lab).await;
        lab.hang("get_slot_information");

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            incubator.get_slot_information(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let lab = SimulatedLab::new();
        let incubator = incubator(&lab).await;

        lab.set_reachable("incubator-control", false);
        assert!(matches!(
            incubator.ping().await,
            Err(ServiceCallError::Transport { .. })
        ));
        assert!(lab
            .connect(ServiceKind::Incubator, "incubator-control")
            .await
            .is_err());

        lab.set_reachable("incubator-control", true);
        assert!(incubator.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_reports_running_then_completed() {
        let lab = SimulatedLab::new();
        lab.set_scan_polls(2);
        let microscope = lab
            .connect(ServiceKind::Microscope, "microscope-control-squid-1")
            .await
            .unwrap()
            .as_microscope()
            .unwrap();

        assert_eq!(
            microscope.scan_get_status().await.unwrap().state,
            ScanState::Idle
        );

        let request = ScanRequest {
            saved_data_type: "raw_images_well_plate".into(),
            well_plate_type: "96".into(),
            illumination_settings: vec![],
            do_contrast_autofocus: false,
            do_reflection_af: false,
            scanning_zone: vec![],
            nx: 1,
            ny: 1,
            dx: 0.8,
            dy: 0.8,
            wells_to_scan: vec![],
            positions: vec![],
            action_id: "exp1".into(),
        };
        microscope.scan_start(&request).await.unwrap();

        let states: Vec<ScanState> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(microscope.scan_get_status().await.unwrap().state);
            }
            out
        };
        assert_eq!(
            states,
            vec![ScanState::Running, ScanState::Running, ScanState::Completed]
        );
    }
}
