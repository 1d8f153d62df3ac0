use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SessionOverrides;

#[derive(Serialize)]
pub struct HeartbeatMessage {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

impl HeartbeatMessage {
    pub fn new() -> Self {
        Self {
            status: "alive",
            timestamp: Utc::now(),
        }
    }
}

impl Default for HeartbeatMessage {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct StartRequest {
    /// Also start the camera worker
    #[serde(default)]
    pub camera: bool,
    /// Settings for this session only
    #[serde(flatten)]
    pub overrides: SessionOverrides,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct VoltageSetpoint {
    pub volts: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HighTimeSetpoint {
    pub seconds: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PolaritySetpoint {
    pub mode: String,
}
