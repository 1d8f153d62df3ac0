//! Backend whose inputs read back the last written outputs, position by position.
//!
//! Used by tests and as the base of the simulator. Faults can be injected through
//! [`LoopbackState`] to exercise the loop's error and teardown paths.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::config::VoltRange;
use crate::hardware::{
    AnalogInput, AnalogOutput, AnalogTask, DaqBackend, HardwareError, Reading, check_ranges,
};

/// Shared state behind a [`LoopbackBackend`] and all tasks it opened
#[derive(Debug, Default)]
pub struct LoopbackState {
    /// Latest vector written to the output task
    pub outputs: Vec<f64>,
    /// Every vector written, in order
    pub writes: Vec<Vec<f64>>,
    /// Number of completed reads
    pub reads: usize,
    /// Lifecycle calls in order, e.g. `"open AO dev2"`, `"close AI"`
    pub calls: Vec<String>,
    /// Fail every write after this many successful writes
    pub fail_write_after: Option<usize>,
    /// Fail every read after this many successful reads
    pub fail_read_after: Option<usize>,
    pub fail_close_output: bool,
    pub fail_close_input: bool,
    /// Blocking time added to every read
    pub read_delay: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
pub struct LoopbackBackend {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Access the shared state, e.g. to inject faults or inspect writes
    pub fn state(&self) -> MutexGuard<'_, LoopbackState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DaqBackend for LoopbackBackend {
    fn open_input(&self, device: &str) -> Result<Box<dyn AnalogInput>, HardwareError> {
        lock(&self.state).calls.push(format!("open AI {device}"));
        Ok(Box::new(LoopbackInput {
            device: device.to_owned(),
            channels: Vec::new(),
            closed: false,
            state: self.state.clone(),
        }))
    }

    fn open_output(&self, device: &str) -> Result<Box<dyn AnalogOutput>, HardwareError> {
        lock(&self.state).calls.push(format!("open AO {device}"));
        Ok(Box::new(LoopbackOutput {
            device: device.to_owned(),
            channels: Vec::new(),
            closed: false,
            state: self.state.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LoopbackInput {
    device: String,
    channels: Vec<(u32, VoltRange)>,
    closed: bool,
    state: Arc<Mutex<LoopbackState>>,
}

impl AnalogTask for LoopbackInput {
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError> {
        debug!("loopback: adding {}/ai{index}", self.device);
        self.channels.push((index, range));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        lock(&self.state).calls.push("start AI".to_owned());
        Ok(())
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        if self.closed {
            return Err(HardwareError::Closed(format!("{} input task", self.device)));
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.calls.push("close AI".to_owned());
        if state.fail_close_input {
            return Err(HardwareError::Driver {
                code: -1,
                message: "input task refused to close".to_owned(),
            });
        }
        Ok(())
    }
}

impl AnalogInput for LoopbackInput {
    fn read(&mut self) -> Result<Reading, HardwareError> {
        if self.closed {
            return Err(HardwareError::Closed(format!("{} input task", self.device)));
        }

        let delay = lock(&self.state).read_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        if state.fail_read_after.is_some_and(|n| state.reads >= n) {
            return Err(HardwareError::Timeout {
                task: format!("{} input task", self.device),
                after: Duration::from_secs(10),
            });
        }
        state.reads += 1;

        let values: Vec<f64> = (0..self.channels.len())
            .map(|pos| state.outputs.get(pos).copied().unwrap_or(0.0))
            .collect();
        Ok(match values.as_slice() {
            [single] => Reading::Scalar(*single),
            _ => Reading::Channels(values),
        })
    }
}

#[derive(Debug)]
pub struct LoopbackOutput {
    device: String,
    channels: Vec<(u32, VoltRange)>,
    closed: bool,
    state: Arc<Mutex<LoopbackState>>,
}

impl AnalogTask for LoopbackOutput {
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError> {
        debug!("loopback: adding {}/ao{index}", self.device);
        self.channels.push((index, range));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        lock(&self.state).calls.push("start AO".to_owned());
        Ok(())
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        if self.closed {
            return Err(HardwareError::Closed(format!("{} output task", self.device)));
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.calls.push("close AO".to_owned());
        if state.fail_close_output {
            return Err(HardwareError::Driver {
                code: -1,
                message: "output task refused to close".to_owned(),
            });
        }
        Ok(())
    }
}

impl AnalogOutput for LoopbackOutput {
    fn write(&mut self, values: &[f64]) -> Result<(), HardwareError> {
        if self.closed {
            return Err(HardwareError::Closed(format!("{} output task", self.device)));
        }
        check_ranges("loopback output task", &self.channels, values)?;

        let mut state = lock(&self.state);
        if state
            .fail_write_after
            .is_some_and(|n| state.writes.len() >= n)
        {
            return Err(HardwareError::Disconnected {
                device: self.device.clone(),
                detail: "simulated disconnect".to_owned(),
            });
        }
        state.outputs = values.to_vec();
        state.writes.push(values.to_vec());
        Ok(())
    }
}
