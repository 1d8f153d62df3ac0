//! Boundary to the analog acquisition hardware.
//!
//! A [`DaqBackend`] opens one input task and one output task per session. Tasks are configured
//! channel by channel in ascending physical index order, and exchange values in that order.

use std::fmt::Debug;
use std::time::Duration;

use thiserror::Error;

use crate::config::VoltRange;

pub mod loopback;
#[cfg(feature = "nidaq")]
pub mod nidaq;
#[cfg(feature = "sim")]
pub mod sim;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("{task} timed out after {after:?}")]
    Timeout { task: String, after: Duration },
    #[error("device {device:?} is disconnected: {detail}")]
    Disconnected { device: String, detail: String },
    #[error("{value} V on channel {index} is outside its range [{min}, {max}] V")]
    OutOfRange {
        index: u32,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{task} expects {expected} values, got {actual}")]
    LengthMismatch {
        task: String,
        expected: usize,
        actual: usize,
    },
    #[error("{0} is already closed")]
    Closed(String),
    #[error("driver error {code}: {message}")]
    Driver { code: i32, message: String },
}

/// Raw result of a read, drivers return a bare scalar for single channel tasks
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Scalar(f64),
    Channels(Vec<f64>),
}

impl From<Reading> for Vec<f64> {
    fn from(reading: Reading) -> Self {
        match reading {
            Reading::Scalar(value) => vec![value],
            Reading::Channels(values) => values,
        }
    }
}

/// Operations shared by input and output tasks
pub trait AnalogTask: Send + Debug {
    /// Register physical channel `index` of the task's device with the given voltage limits
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError>;

    /// Commit the channel configuration, called once after all channels are added
    fn start(&mut self) -> Result<(), HardwareError>;

    fn channel_count(&self) -> usize;

    /// Release the driver handle
    fn close(&mut self) -> Result<(), HardwareError>;
}

pub trait AnalogInput: AnalogTask {
    /// Read one sample of every channel in a single call, blocking up to the task timeout
    fn read(&mut self) -> Result<Reading, HardwareError>;
}

pub trait AnalogOutput: AnalogTask {
    /// Write one value per channel in a single call so channels update together
    fn write(&mut self, values: &[f64]) -> Result<(), HardwareError>;

    /// Drive every channel to 0 V
    fn to_safe_state(&mut self) -> Result<(), HardwareError> {
        let zeros = vec![0.0; self.channel_count()];
        self.write(&zeros)
    }
}

pub trait DaqBackend: Send + Sync + Debug {
    fn open_input(&self, device: &str) -> Result<Box<dyn AnalogInput>, HardwareError>;

    fn open_output(&self, device: &str) -> Result<Box<dyn AnalogOutput>, HardwareError>;
}

/// Check a vector against per-channel limits before it reaches the driver
pub(crate) fn check_ranges(
    task: &str,
    channels: &[(u32, VoltRange)],
    values: &[f64],
) -> Result<(), HardwareError> {
    if values.len() != channels.len() {
        return Err(HardwareError::LengthMismatch {
            task: task.to_owned(),
            expected: channels.len(),
            actual: values.len(),
        });
    }
    for ((index, range), value) in channels.iter().zip(values) {
        if !range.contains(*value) {
            return Err(HardwareError::OutOfRange {
                index: *index,
                value: *value,
                min: range.min,
                max: range.max,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_reading_becomes_single_element() {
        assert_eq!(Vec::<f64>::from(Reading::Scalar(1.5)), vec![1.5]);
        assert_eq!(
            Vec::<f64>::from(Reading::Channels(vec![1.0, 2.0])),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn range_check_reports_offending_channel() {
        let channels = [(0, VoltRange::new(-10.0, 10.0)), (3, VoltRange::new(0.0, 5.0))];
        assert!(check_ranges("AO", &channels, &[1.0, 2.0]).is_ok());
        assert_eq!(
            check_ranges("AO", &channels, &[1.0, -2.0]),
            Err(HardwareError::OutOfRange {
                index: 3,
                value: -2.0,
                min: 0.0,
                max: 5.0
            })
        );
        assert!(matches!(
            check_ranges("AO", &channels, &[1.0]),
            Err(HardwareError::LengthMismatch { expected: 2, .. })
        ));
    }
}
