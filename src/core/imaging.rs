//! One imaging run: start a scan on the microscope and poll it to the end.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::adapters::{Incubator, Microscope, ScanRequest, ScanState, ServiceProxy};
use crate::config::{Timeouts, SECTION_MARGIN};
use crate::domain::Task;
use crate::error::{OrchestratorError, Result};

/// Plate type assumed when the incubator cannot tell
pub const DEFAULT_PLATE_TYPE: &str = "96";

/// Status polls that may fail in a row before the scan is given up
pub const MAX_POLL_FAILURES: u32 = 3;

/// Timing of the scan/poll cycle
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub poll_interval: Duration,
    pub status_call_timeout: Duration,
    /// Bound on `scan_start` and the plate type query
    pub call_timeout: Duration,
    pub max_poll_failures: u32,
    /// Load, unload and slack around a scan; with the scan limit this bounds
    /// a cycle's critical section
    pub cycle_overhead: Duration,
}

impl ScanPolicy {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            poll_interval: timeouts.scan_poll,
            status_call_timeout: timeouts.scan_status_call,
            call_timeout: timeouts.call,
            max_poll_failures: MAX_POLL_FAILURES,
            cycle_overhead: timeouts.load + timeouts.unload + SECTION_MARGIN,
        }
    }

    /// Longest a whole cycle of `task` may hold its critical section
    pub fn cycle_limit(&self, task: &Task) -> Duration {
        self.cycle_overhead.saturating_add(scan_limit(task))
    }
}

/// Hard limit on one scan of `task`
pub fn scan_limit(task: &Task) -> Duration {
    Duration::from_secs(task.settings.imaging.scan_timeout_minutes.saturating_mul(60))
}

/// Action id sent with the scan
pub fn action_id(task_name: &str) -> String {
    task_name.replace(' ', "_")
}

pub fn build_request(task: &Task, well_plate_type: String) -> ScanRequest {
    let settings = &task.settings;
    let imaging = &settings.imaging;
    ScanRequest {
        saved_data_type: settings.data_type.clone(),
        well_plate_type,
        illumination_settings: imaging.illumination_settings.clone(),
        do_contrast_autofocus: imaging.do_contrast_autofocus,
        do_reflection_af: imaging.do_reflection_af,
        scanning_zone: imaging.imaging_zone.clone(),
        nx: imaging.nx,
        ny: imaging.ny,
        dx: imaging.dx,
        dy: imaging.dy,
        wells_to_scan: settings.wells.clone(),
        positions: settings.positions.clone(),
        action_id: action_id(&task.name),
    }
}

/// The task's plate type override, else the incubator's answer, else "96"
async fn plate_type(
    task: &Task,
    incubator: Option<&Arc<dyn Incubator>>,
    call_timeout: Duration,
) -> String {
    if let Some(ref plate) = task.settings.imaging.well_plate_type {
        return plate.clone();
    }
    let Some(incubator) = incubator else {
        return DEFAULT_PLATE_TYPE.to_string();
    };

    let slot = task.settings.incubator_slot;
    match timeout(call_timeout, incubator.get_well_plate_type(slot)).await {
        Ok(Ok(plate)) => {
            debug!(slot, %plate, "Well plate type from incubator");
            plate
        }
        Ok(Err(e)) => {
            warn!(slot, error = %e, "Could not read well plate type; using default");
            DEFAULT_PLATE_TYPE.to_string()
        }
        Err(_) => {
            warn!(slot, "Well plate type query timed out; using default");
            DEFAULT_PLATE_TYPE.to_string()
        }
    }
}

/// Start a scan for `task` and wait until the microscope reports it finished
pub async fn run_scan(
    task: &Task,
    incubator: Option<Arc<dyn Incubator>>,
    microscope: Arc<dyn Microscope>,
    policy: &ScanPolicy,
) -> Result<()> {
    let failed = |reason: String| OrchestratorError::Imaging {
        task: task.name.clone(),
        reason,
    };

    let plate = plate_type(task, incubator.as_ref(), policy.call_timeout).await;
    let request = build_request(task, plate);
    let limit = scan_limit(task);

    info!(
        task = %task.name,
        microscope = microscope.service_id(),
        plate = %request.well_plate_type,
        timeout_min = task.settings.imaging.scan_timeout_minutes,
        "Starting scan"
    );

    timeout(policy.call_timeout, microscope.scan_start(&request))
        .await
        .map_err(|_| failed(format!("scan_start gave no reply within {:?}", policy.call_timeout)))?
        .map_err(|e| failed(format!("scan_start failed: {}", e)))?;

    let started = Instant::now();
    let mut failures = 0u32;
    let mut last_progress = None;

    loop {
        if started.elapsed() > limit {
            return Err(failed(format!(
                "scan timed out after {} minutes",
                task.settings.imaging.scan_timeout_minutes
            )));
        }

        let polled = timeout(policy.status_call_timeout, microscope.scan_get_status())
            .await
            .map_err(|_| format!("no reply within {:?}", policy.status_call_timeout))
            .and_then(|r| r.map_err(|e| e.to_string()));

        match polled {
            Ok(status) => {
                failures = 0;
                if last_progress != Some(status.progress) {
                    info!(
                        task = %task.name,
                        progress = status.progress,
                        well = status.current_well.as_deref().unwrap_or("-"),
                        "Scan progress"
                    );
                    last_progress = Some(status.progress);
                }

                match status.state {
                    ScanState::Completed => {
                        info!(task = %task.name, elapsed_s = started.elapsed().as_secs(), "Scan completed");
                        return Ok(());
                    }
                    ScanState::Failed => {
                        let error = status
                            .error
                            .or(status.message)
                            .unwrap_or_else(|| "unknown error".to_string());
                        return Err(failed(format!("scan failed: {}", error)));
                    }
                    ScanState::Running => {}
                    other => warn!(task = %task.name, state = ?other, "Unexpected scan state; still polling"),
                }
            }
            Err(reason) => {
                failures += 1;
                warn!(
                    task = %task.name,
                    attempt = failures,
                    max = policy.max_poll_failures,
                    %reason,
                    "Scan status poll failed"
                );
                if failures >= policy.max_poll_failures {
                    return Err(failed(format!(
                        "scan status unavailable after {} consecutive attempts: {}",
                        failures, reason
                    )));
                }
            }
        }

        sleep(policy.poll_interval).await;
    }
}
