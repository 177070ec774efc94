//! Imaging tasks and their state machine.
//!
//! A task owns an ordered plan of time points. Each time point lives in
//! exactly one of `pending_time_points` or `imaged_time_points`.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::slot::MAX_SLOT_ID;

/// Longest scan a task may ask for (one day)
pub const MAX_SCAN_TIMEOUT_MINUTES: u64 = 24 * 60;

/// A scheduled imaging instant, in naive local time (`2024-01-01T10:00:00`)
pub type TimePoint = NaiveDateTime;

/// Operational state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    Pending,
    Started,
    Completed,
    Paused,
    Error,
}

impl OperationalState {
    /// States the scheduler will dispatch work for
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }

    /// Completed and error are left only by an explicit operator action
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether `self → to` is an edge of the task state graph.
    ///
    /// `paused_from` is the state recorded when the task was paused; a paused
    /// task may only go back to exactly that state (or to error).
    pub fn can_transition(self, to: Self, paused_from: Option<Self>) -> bool {
        use OperationalState::*;
        match (self, to) {
            (Pending, Started) | (Started, Completed) => true,
            (Pending | Started, Paused) => true,
            (Paused, target) if target != Error => paused_from == Some(target),
            (Pending | Started | Paused, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Whether a task needs physical transport before imaging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Load from the incubator, image, unload back
    FullAutomation,
    /// The sample already sits on the microscope; image only
    MicroscopeOnly,
}

/// An imaging task as stored in the task file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task name
    pub name: String,

    /// Current state
    #[serde(default = "default_state")]
    pub operational_state: OperationalState,

    /// State to return to when resumed (present only while paused)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<OperationalState>,

    /// Latest failure or operator note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time points still to be imaged, ascending
    #[serde(default)]
    pub pending_time_points: Vec<TimePoint>,

    /// Time points already imaged, ascending
    #[serde(default)]
    pub imaged_time_points: Vec<TimePoint>,

    pub settings: TaskSettings,
}

fn default_state() -> OperationalState {
    OperationalState::Pending
}

impl Task {
    /// Create a pending task with the given plan
    pub fn new(
        name: impl Into<String>,
        settings: TaskSettings,
        mut pending_time_points: Vec<TimePoint>,
    ) -> Self {
        pending_time_points.sort();
        pending_time_points.dedup();
        Self {
            name: name.into(),
            operational_state: OperationalState::Pending,
            paused_from: None,
            message: None,
            pending_time_points,
            imaged_time_points: Vec::new(),
            settings,
        }
    }

    /// Earliest pending time point
    pub fn next_time_point(&self) -> Option<TimePoint> {
        self.pending_time_points.first().copied()
    }

    /// Earliest pending time point if it is due at `now`
    pub fn due_time_point(&self, now: TimePoint) -> Option<TimePoint> {
        self.next_time_point().filter(|tp| *tp <= now)
    }

    /// Sort both time point lists in place
    pub fn normalize(&mut self) {
        self.pending_time_points.sort();
        self.imaged_time_points.sort();
    }

    /// Check the per-task invariants. Returns a human readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("task name cannot be empty".to_string());
        }

        let slot = self.settings.incubator_slot;
        if slot == 0 || slot > MAX_SLOT_ID {
            return Err(format!(
                "task '{}': incubator_slot {} out of range 1..={}",
                self.name, slot, MAX_SLOT_ID
            ));
        }

        let scan_timeout = self.settings.imaging.scan_timeout_minutes;
        if scan_timeout == 0 || scan_timeout > MAX_SCAN_TIMEOUT_MINUTES {
            return Err(format!(
                "task '{}': scan_timeout_minutes {} out of range 1..={}",
                self.name, scan_timeout, MAX_SCAN_TIMEOUT_MINUTES
            ));
        }

        if self.settings.allocated_microscope.trim().is_empty() {
            return Err(format!("task '{}': allocated_microscope is empty", self.name));
        }

        for (label, points) in [
            ("pending_time_points", &self.pending_time_points),
            ("imaged_time_points", &self.imaged_time_points),
        ] {
            if points.windows(2).any(|w| w[0] == w[1]) {
                return Err(format!("task '{}': duplicate entry in {}", self.name, label));
            }
        }

        if let Some(tp) = self
            .pending_time_points
            .iter()
            .find(|tp| self.imaged_time_points.binary_search(tp).is_ok())
        {
            return Err(format!(
                "task '{}': time point {} is both pending and imaged",
                self.name, tp
            ));
        }

        match (self.operational_state, self.paused_from) {
            (OperationalState::Paused, None) => {
                return Err(format!("task '{}': paused without paused_from", self.name));
            }
            (OperationalState::Paused, Some(prior)) if !prior.is_dispatchable() => {
                return Err(format!(
                    "task '{}': cannot resume to '{}' from pause",
                    self.name, prior
                ));
            }
            (state, Some(_)) if state != OperationalState::Paused => {
                return Err(format!(
                    "task '{}': paused_from set while in state '{}'",
                    self.name, state
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

/// Imaging settings for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub scan_mode: ScanMode,

    /// How the microscope saves data (`raw_images_well_plate`, `raw_image_flexible`, ...)
    #[serde(default = "default_data_type")]
    pub data_type: String,

    /// Incubator slot holding this task's sample (1..=80)
    pub incubator_slot: u8,

    /// Microscope service that images this sample
    #[serde(default = "default_microscope")]
    pub allocated_microscope: String,

    /// Wells to scan (well-plate data types)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wells: Vec<String>,

    /// Stage positions to scan (flexible data types)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<StagePosition>,

    #[serde(default)]
    pub imaging: ImagingParameters,

    /// Free-form sample metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_info: Option<serde_json::Map<String, serde_json::Value>>,
}

fn default_data_type() -> String {
    "raw_images_well_plate".to_string()
}

fn default_microscope() -> String {
    "microscope-control-squid-1".to_string()
}

impl TaskSettings {
    /// Settings with defaults for the given mode and slot
    pub fn new(scan_mode: ScanMode, incubator_slot: u8) -> Self {
        Self {
            scan_mode,
            data_type: default_data_type(),
            incubator_slot,
            allocated_microscope: default_microscope(),
            wells: Vec::new(),
            positions: Vec::new(),
            imaging: ImagingParameters::default(),
            sample_info: None,
        }
    }

    pub fn with_microscope(mut self, microscope: impl Into<String>) -> Self {
        self.allocated_microscope = microscope.into();
        self
    }
}

/// A stage position for flexible scans (mm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

/// Microscope scan parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingParameters {
    /// Well range to scan, as `[[row, col], [row, col]]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imaging_zone: Vec<[u32; 2]>,

    #[serde(default = "default_tiles")]
    pub nx: u32,

    #[serde(default = "default_tiles")]
    pub ny: u32,

    /// Tile spacing in mm
    #[serde(default = "default_step_mm")]
    pub dx: f64,

    #[serde(default = "default_step_mm")]
    pub dy: f64,

    #[serde(default)]
    pub illumination_settings: Vec<IlluminationChannel>,

    #[serde(default)]
    pub do_contrast_autofocus: bool,

    #[serde(default)]
    pub do_reflection_af: bool,

    /// Upper bound on one scan
    #[serde(default = "default_scan_timeout_minutes")]
    pub scan_timeout_minutes: u64,

    /// Overrides the plate type reported by the incubator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well_plate_type: Option<String>,
}

fn default_tiles() -> u32 {
    1
}

fn default_step_mm() -> f64 {
    0.8
}

fn default_scan_timeout_minutes() -> u64 {
    40
}

impl Default for ImagingParameters {
    fn default() -> Self {
        Self {
            imaging_zone: Vec::new(),
            nx: default_tiles(),
            ny: default_tiles(),
            dx: default_step_mm(),
            dy: default_step_mm(),
            illumination_settings: Vec::new(),
            do_contrast_autofocus: false,
            do_reflection_af: false,
            scan_timeout_minutes: default_scan_timeout_minutes(),
            well_plate_type: None,
        }
    }
}

/// One illumination channel of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IlluminationChannel {
    pub channel: String,
    pub intensity: f64,
    pub exposure_time: f64,
}
