//! Incubator sample slots.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Highest slot number on the incubator
pub const MAX_SLOT_ID: u8 = 80;

/// Whether a slot holds a sample plate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    Empty,
    Occupied,
}

/// Where a sample plate physically is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SampleLocation {
    IncubatorSlot,
    IncubatorStation,
    RoboticArm,
    /// On the microscope reached through the given arm station
    Microscope(u8),
    Unknown,
}

impl fmt::Display for SampleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncubatorSlot => f.write_str("incubator_slot"),
            Self::IncubatorStation => f.write_str("incubator_station"),
            Self::RoboticArm => f.write_str("robotic_arm"),
            Self::Microscope(station) => write!(f, "microscope{}", station),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl FromStr for SampleLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incubator_slot" => Ok(Self::IncubatorSlot),
            "incubator_station" => Ok(Self::IncubatorStation),
            "robotic_arm" => Ok(Self::RoboticArm),
            "unknown" | "Unknown" => Ok(Self::Unknown),
            other => other
                .strip_prefix("microscope")
                .and_then(|n| n.parse::<u8>().ok())
                .map(Self::Microscope)
                .ok_or_else(|| format!("unknown sample location '{}'", other)),
        }
    }
}

impl TryFrom<String> for SampleLocation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SampleLocation> for String {
    fn from(location: SampleLocation) -> Self {
        location.to_string()
    }
}

/// A persisted incubator slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSlot {
    pub slot_id: u8,

    pub occupancy: Occupancy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_info: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incubation_start: Option<NaiveDateTime>,

    #[serde(default = "default_location")]
    pub location: SampleLocation,
}

fn default_location() -> SampleLocation {
    SampleLocation::IncubatorSlot
}

impl SampleSlot {
    /// An empty slot
    pub fn empty(slot_id: u8) -> Self {
        Self {
            slot_id,
            occupancy: Occupancy::Empty,
            sample_info: None,
            incubation_start: None,
            location: SampleLocation::IncubatorSlot,
        }
    }

    /// An occupied slot whose plate sits in the incubator
    pub fn occupied(slot_id: u8) -> Self {
        Self {
            occupancy: Occupancy::Occupied,
            ..Self::empty(slot_id)
        }
    }
}

/// Slot state as reported by the incubator service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub slot_id: u8,
    pub occupied: bool,
    #[serde(default)]
    pub sample_name: Option<String>,
    #[serde(default = "default_location")]
    pub location: SampleLocation,
}
