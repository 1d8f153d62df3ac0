//! Simulated rig: every input channel sees the amplifier control output plus a little noise.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::random_range;
use tracing::info;

use crate::config::VoltRange;
use crate::hardware::{
    AnalogInput, AnalogOutput, AnalogTask, DaqBackend, HardwareError, Reading, check_ranges,
};

/// Conversion time of one simulated read
const SIM_READ_LATENCY: Duration = Duration::from_millis(1);
/// Peak noise added to every simulated reading, volts
const SIM_NOISE: f64 = 0.002;

#[derive(Debug, Clone)]
pub struct Sim {
    /// Physical output channel the simulated monitors follow
    control_channel: Option<u32>,
    /// Latest value written to the followed output channel
    control: Arc<Mutex<f64>>,
}

impl Sim {
    /// Simulated rig whose monitors follow output channel `control_channel`, usually the
    /// `voltage-control` output. Without one the monitors read noise around 0 V.
    pub fn following(control_channel: Option<u32>) -> Self {
        Self {
            control_channel,
            control: Arc::new(Mutex::new(0.0)),
        }
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::following(Some(0))
    }
}

impl DaqBackend for Sim {
    fn open_input(&self, device: &str) -> Result<Box<dyn AnalogInput>, HardwareError> {
        info!("Sim opening input task on {device}");
        Ok(Box::new(SimInput {
            device: device.to_owned(),
            channels: Vec::new(),
            control: self.control.clone(),
        }))
    }

    fn open_output(&self, device: &str) -> Result<Box<dyn AnalogOutput>, HardwareError> {
        info!("Sim opening output task on {device}");
        Ok(Box::new(SimOutput {
            device: device.to_owned(),
            channels: Vec::new(),
            control_channel: self.control_channel,
            control: self.control.clone(),
        }))
    }
}

fn poisoned(device: &str) -> HardwareError {
    HardwareError::Driver {
        code: -1,
        message: format!("simulated device {device} state is poisoned"),
    }
}

#[derive(Debug)]
struct SimInput {
    device: String,
    channels: Vec<(u32, VoltRange)>,
    control: Arc<Mutex<f64>>,
}

impl AnalogTask for SimInput {
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError> {
        info!("Sim adding {}/ai{index} {:?}", self.device, range);
        self.channels.push((index, range));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        info!("Sim closing input task on {}", self.device);
        Ok(())
    }
}

impl AnalogInput for SimInput {
    fn read(&mut self) -> Result<Reading, HardwareError> {
        thread::sleep(SIM_READ_LATENCY);
        let control = *self.control.lock().map_err(|_| poisoned(&self.device))?;

        let values: Vec<f64> = self
            .channels
            .iter()
            .map(|(_, range)| {
                (control + random_range(-SIM_NOISE..=SIM_NOISE)).clamp(range.min, range.max)
            })
            .collect();
        Ok(match values.as_slice() {
            [single] => Reading::Scalar(*single),
            _ => Reading::Channels(values),
        })
    }
}

#[derive(Debug)]
struct SimOutput {
    device: String,
    channels: Vec<(u32, VoltRange)>,
    control_channel: Option<u32>,
    control: Arc<Mutex<f64>>,
}

impl AnalogTask for SimOutput {
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError> {
        info!("Sim adding {}/ao{index} {:?}", self.device, range);
        self.channels.push((index, range));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        info!("Sim closing output task on {}", self.device);
        Ok(())
    }
}

impl AnalogOutput for SimOutput {
    fn write(&mut self, values: &[f64]) -> Result<(), HardwareError> {
        check_ranges("simulated output task", &self.channels, values)?;
        let followed = self
            .channels
            .iter()
            .position(|(index, _)| Some(*index) == self.control_channel);
        if let Some(value) = followed.and_then(|pos| values.get(pos)) {
            *self.control.lock().map_err(|_| poisoned(&self.device))? = *value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_follow_the_control_output() {
        let sim = Sim::default();
        let range = VoltRange::new(-10.0, 10.0);
        let mut output = sim.open_output("dev2").unwrap();
        let mut input = sim.open_input("dev1").unwrap();
        output.add_channel(0, range).unwrap();
        input.add_channel(0, range).unwrap();
        input.add_channel(1, range).unwrap();

        output.write(&[2.5]).unwrap();
        let read: Vec<f64> = input.read().unwrap().into();
        assert_eq!(read.len(), 2);
        assert!(read.iter().all(|v| (v - 2.5).abs() <= SIM_NOISE + 1e-9));
    }

    #[test]
    fn inputs_follow_the_configured_channel_not_the_first() {
        let sim = Sim::following(Some(1));
        let range = VoltRange::new(-10.0, 10.0);
        let mut output = sim.open_output("dev2").unwrap();
        let mut input = sim.open_input("dev1").unwrap();
        output.add_channel(0, range).unwrap();
        output.add_channel(1, range).unwrap();
        input.add_channel(0, range).unwrap();

        // AO0 carries the camera trigger pulse, AO1 the amplifier control
        output.write(&[5.0, -1.5]).unwrap();
        let read: Vec<f64> = input.read().unwrap().into();
        assert!((read[0] + 1.5).abs() <= SIM_NOISE + 1e-9);
    }
}
