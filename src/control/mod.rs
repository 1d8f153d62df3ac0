use std::time::Duration;

use serde::Serialize;

use crate::config::{SessionConfig, validate_high_time};
use crate::control::polarity::PolarityMode;

pub mod output;
pub mod polarity;

/// Setpoints the foreground may change while the acquisition loop runs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSettings {
    /// Requested emitter voltage in volts
    pub target_voltage: f64,
    /// Dwell time of each polarity phase
    #[serde(with = "humantime_serde")]
    pub high_time: Duration,
    pub polarity_mode: PolarityMode,
}

impl LoopSettings {
    /// Initial setpoints from configuration; an invalid high time falls back to the default
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            target_voltage: config.polarity.target_voltage,
            high_time: validate_high_time(config.polarity.high_time)
                .unwrap_or(Duration::from_secs(1)),
            polarity_mode: config.polarity.mode.clone(),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}
