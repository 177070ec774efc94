//! Health handles for the proxied hardware services.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hardware class behind a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Incubator,
    RoboticArm,
    Microscope,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incubator => f.write_str("incubator"),
            Self::RoboticArm => f.write_str("robotic_arm"),
            Self::Microscope => f.write_str("microscope"),
        }
    }
}

/// Connection state as judged by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    Live,
    Unreachable,
}

/// Liveness record for one service. Only the health monitor mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub name: String,
    pub kind: ServiceKind,
    pub connection: Connection,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>, kind: ServiceKind, connection: Connection) -> Self {
        Self {
            name: name.into(),
            kind,
            connection,
            last_health_check: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.connection == Connection::Live
    }
}
