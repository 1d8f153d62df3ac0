//! Resources owned by one acquisition session and their teardown.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::*;

use crate::acquisition::data_log::{self, DataLog, DataLogError};
use crate::config::{ChannelLayout, SessionConfig};
use crate::hardware::{AnalogInput, AnalogOutput, DaqBackend, HardwareError};
use crate::system::SessionError;

/// A failed teardown step. Reported, never escalated.
#[derive(Error, Debug)]
pub enum TeardownError {
    #[error("failed to drive outputs to 0 V: {0}")]
    ZeroOutputs(HardwareError),
    #[error("failed to close output task: {0}")]
    CloseOutput(HardwareError),
    #[error("failed to close input task: {0}")]
    CloseInput(HardwareError),
    #[error("failed to close data log: {0}")]
    CloseDataLog(DataLogError),
}

/// Channel maps, hardware tasks and data log of one session.
///
/// Teardown runs exactly once, on the first of [`Session::teardown`] or drop.
#[derive(Debug)]
pub struct Session {
    layout: ChannelLayout,
    output: Option<Box<dyn AnalogOutput>>,
    input: Option<Box<dyn AnalogInput>>,
    /// Set once the output task is started and may be written
    outputs_live: bool,
    log: Option<DataLog>,
    torn_down: bool,
}

impl Session {
    /// Configure and start the output task, drive it to 0 V, configure and start the input task,
    /// then open the data log at `path`.
    ///
    /// Whatever was opened before a failure is torn down again when the partial session drops.
    pub fn open(
        config: &SessionConfig,
        layout: ChannelLayout,
        backend: &dyn DaqBackend,
        path: &Path,
    ) -> Result<Self, SessionError> {
        let daq = &config.daq;
        let mut session = Self {
            layout,
            output: None,
            input: None,
            outputs_live: false,
            log: None,
            torn_down: false,
        };

        if !session.layout.outputs.is_empty() {
            let output = session
                .output
                .insert(backend.open_output(&daq.output_device)?);
            for index in session.layout.outputs.indices() {
                output.add_channel(index, daq.output_range)?;
            }
            output.start()?;
            session.outputs_live = true;
            output.to_safe_state()?;
            info!(
                "output task on {} started with {} channels",
                daq.output_device,
                output.channel_count()
            );
        }

        if !session.layout.inputs.is_empty() {
            let input = session.input.insert(backend.open_input(&daq.input_device)?);
            for index in session.layout.inputs.indices() {
                input.add_channel(index, daq.input_range)?;
            }
            input.start()?;
            info!(
                "input task on {} started with {} channels",
                daq.input_device,
                input.channel_count()
            );
        }

        session.log = Some(DataLog::create(
            path,
            &data_log::header(&session.layout),
        )?);
        Ok(session)
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.log.as_ref().map(DataLog::path)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Write one value per output channel in a single call; a no-op without outputs
    pub fn write_outputs(&mut self, values: &[f64]) -> Result<(), HardwareError> {
        if self.torn_down {
            return Err(HardwareError::Closed("output task".to_owned()));
        }
        match self.output.as_mut() {
            Some(output) => output.write(values),
            None => Ok(()),
        }
    }

    /// Read every input channel in a single call; empty without inputs
    pub fn read_inputs(&mut self) -> Result<Vec<f64>, HardwareError> {
        if self.torn_down {
            return Err(HardwareError::Closed("input task".to_owned()));
        }
        let Some(input) = self.input.as_mut() else {
            return Ok(Vec::new());
        };

        let values: Vec<f64> = input.read()?.into();
        if values.len() != self.layout.inputs.len() {
            return Err(HardwareError::LengthMismatch {
                task: "input task".to_owned(),
                expected: self.layout.inputs.len(),
                actual: values.len(),
            });
        }
        Ok(values)
    }

    pub fn append_row(
        &mut self,
        elapsed: Duration,
        inputs: &[f64],
        outputs: &[f64],
    ) -> Result<(), DataLogError> {
        match self.log.as_mut() {
            Some(log) => log.append(elapsed, inputs, outputs),
            None => Err(DataLogError::Closed(PathBuf::new())),
        }
    }

    /// Drive the outputs to 0 V, close the output task, close the input task, close the data
    /// log. Every step is attempted; failed steps are returned. Later calls do nothing.
    pub fn teardown(&mut self) -> Vec<TeardownError> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;
        let mut errors = Vec::new();

        if let Some(output) = self.output.as_mut() {
            if self.outputs_live {
                if let Err(err) = output.to_safe_state() {
                    errors.push(TeardownError::ZeroOutputs(err));
                }
            }
        }
        if let Some(mut output) = self.output.take() {
            if let Err(err) = output.close() {
                errors.push(TeardownError::CloseOutput(err));
            }
        }
        if let Some(mut input) = self.input.take() {
            if let Err(err) = input.close() {
                errors.push(TeardownError::CloseInput(err));
            }
        }
        if let Some(mut log) = self.log.take() {
            if let Err(err) = log.close() {
                errors.push(TeardownError::CloseDataLog(err));
            }
        }

        for err in &errors {
            warn!("session teardown: {err}");
        }
        errors
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
