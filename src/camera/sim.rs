use std::thread;
use std::time::{Duration, Instant};

use rand::random_range;
use tracing::info;

use crate::camera::{Camera, CameraError, CameraProvider, Frame, TriggerMode};
use crate::config::CameraConfig;

/// Largest simulated frame edge, keeps simulated frames small regardless of ROI
const SIM_MAX_EDGE: u32 = 256;

#[derive(Debug, Default)]
pub struct SimCameraProvider;

impl CameraProvider for SimCameraProvider {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn Camera>, CameraError> {
        info!("Sim camera opened with ROI {:?} at {} fps", config.roi, config.frame_rate);
        Ok(Box::new(SimCamera::new(config)))
    }
}

/// Produces noise frames at the configured frame rate once armed and triggered
#[derive(Debug)]
pub struct SimCamera {
    trigger: TriggerMode,
    width: u32,
    height: u32,
    frame_interval: Duration,
    armed_at: Option<Instant>,
    triggered: bool,
    next_frame: Option<Instant>,
}

impl SimCamera {
    pub fn new(config: &CameraConfig) -> Self {
        let frame_rate = if config.frame_rate > 0.0 {
            config.frame_rate
        } else {
            10.0
        };
        Self {
            trigger: config.trigger,
            width: config.roi[0].clamp(1, SIM_MAX_EDGE),
            height: config.roi[1].clamp(1, SIM_MAX_EDGE),
            frame_interval: Duration::from_secs_f64(1.0 / frame_rate),
            armed_at: None,
            triggered: false,
            next_frame: None,
        }
    }
}

impl Camera for SimCamera {
    fn arm(&mut self, buffer_depth: u32) -> Result<(), CameraError> {
        info!("Sim camera armed with {buffer_depth} buffers");
        self.armed_at = Some(Instant::now());
        Ok(())
    }

    fn issue_software_trigger(&mut self) -> Result<(), CameraError> {
        if self.armed_at.is_none() {
            return Err(CameraError::NotArmed);
        }
        self.triggered = true;
        Ok(())
    }

    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CameraError> {
        let armed_at = self.armed_at.ok_or(CameraError::NotArmed)?;
        // In hardware mode the pulse train on the trigger output is assumed to be running
        if self.trigger == TriggerMode::Software && !self.triggered {
            thread::sleep(timeout);
            return Ok(None);
        }

        let now = Instant::now();
        let due = self.next_frame.unwrap_or(now);
        if due > now + timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(due.saturating_duration_since(now));
        self.next_frame = Some(due + self.frame_interval);

        let level: u16 = random_range(0..4096);
        let image_buffer = (0..self.width * self.height)
            .map(|_| level.saturating_add(random_range(0..64)))
            .collect();
        Ok(Some(Frame {
            image_buffer,
            timestamp_ns: u64::try_from(due.duration_since(armed_at).as_nanos()).ok(),
            width: self.width,
            height: self.height,
        }))
    }

    fn disarm(&mut self) -> Result<(), CameraError> {
        info!("Sim camera disarmed");
        self.armed_at = None;
        self.triggered = false;
        self.next_frame = None;
        Ok(())
    }

    fn dispose(&mut self) -> Result<(), CameraError> {
        info!("Sim camera disposed");
        Ok(())
    }
}
