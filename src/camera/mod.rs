//! Camera boundary and the camera acquisition loop.
//!
//! The loop is the acquisition loop's sibling: it runs on its own thread, publishes every frame
//! to the observers and always disarms and disposes the camera on exit.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::*;

use crate::config::CameraConfig;
use crate::events::{EventSender, SessionEvent, Worker};
use crate::worker::{StopFlag, WorkerState};

#[cfg(feature = "sim")]
pub mod sim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// One software trigger starts continuous acquisition
    #[default]
    Software,
    /// Every frame waits for a pulse on the `camera-trigger` output
    Hardware,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("no camera available")]
    NoCamera,
    #[error("camera is not armed")]
    NotArmed,
    #[error("timed out after {0:?} while polling for a frame")]
    FrameTimeout(Duration),
    #[error("camera sdk error: {0}")]
    Sdk(String),
}

/// One captured image
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image_buffer: Vec<u16>,
    /// Camera timestamp relative to arming, when the sensor provides one
    pub timestamp_ns: Option<u64>,
    pub width: u32,
    pub height: u32,
}

pub trait Camera: Send + Debug {
    fn arm(&mut self, buffer_depth: u32) -> Result<(), CameraError>;

    fn issue_software_trigger(&mut self) -> Result<(), CameraError>;

    /// Wait up to `timeout` for the next frame, `None` when nothing arrived
    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CameraError>;

    fn disarm(&mut self) -> Result<(), CameraError>;

    /// Free the camera's SDK resources
    fn dispose(&mut self) -> Result<(), CameraError>;
}

/// Opens the camera for a session
pub trait CameraProvider: Send + Sync + Debug {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn Camera>, CameraError>;
}

/// Run the camera loop until `stop` is requested or the camera fails.
/// Returns the number of frames published.
pub fn run_camera_loop(
    mut camera: Box<dyn Camera>,
    config: CameraConfig,
    stop: StopFlag,
    events: EventSender,
    state: watch::Sender<WorkerState>,
) -> Result<u64, CameraError> {
    state.send_replace(WorkerState::Running);
    events.log("Camera: Initializing...");

    let mut armed = false;
    let mut frames = 0;
    let result = acquire(&mut *camera, &config, &stop, &events, &mut armed, &mut frames);

    state.send_replace(WorkerState::Stopping);
    if let Err(err) = &result {
        error!("camera loop stopped on error: {err}");
        events.log(format!("Camera Error: {err}"));
    }

    // Teardown: each step is attempted regardless of the previous one
    if armed {
        if let Err(err) = camera.disarm() {
            warn!("failed to disarm camera: {err}");
            events.log(format!("Camera: failed to disarm: {err}"));
        }
    }
    if let Err(err) = camera.dispose() {
        warn!("failed to dispose camera: {err}");
        events.log(format!("Camera: failed to dispose: {err}"));
    }
    info!("camera loop finished after {frames} frames");
    events.log(format!("Camera: Disconnected after {frames} frames."));

    state.send_replace(WorkerState::Stopped);
    events.publish(SessionEvent::WorkerExited {
        worker: Worker::Camera,
        error: result.as_ref().err().map(ToString::to_string),
    });
    result.map(|_| frames)
}

fn acquire(
    camera: &mut dyn Camera,
    config: &CameraConfig,
    stop: &StopFlag,
    events: &EventSender,
    armed: &mut bool,
    frames: &mut u64,
) -> Result<(), CameraError> {
    camera.arm(config.buffer_depth)?;
    *armed = true;
    events.log(format!("Camera: Armed in {:?} trigger mode.", config.trigger));

    if config.trigger == TriggerMode::Software {
        camera.issue_software_trigger()?;
    }

    while !stop.is_requested() {
        match camera.poll_frame(config.poll_timeout)? {
            Some(frame) => {
                *frames += 1;
                debug!(
                    "frame {} ({}x{}) at {:?} ns",
                    frames, frame.width, frame.height, frame.timestamp_ns
                );
                events.publish(SessionEvent::ImageReady(Arc::new(frame)));
            }
            None if config.trigger == TriggerMode::Software => {
                return Err(CameraError::FrameTimeout(config.poll_timeout));
            }
            // No trigger pulse arrived within the poll timeout
            None => trace!("no hardware triggered frame yet"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::events;

    /// Camera that replays a script of poll results and records every call
    #[derive(Debug)]
    struct ScriptedCamera {
        polls: Vec<Result<Option<Frame>, CameraError>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
        stop_when_empty: StopFlag,
    }

    impl Camera for ScriptedCamera {
        fn arm(&mut self, _buffer_depth: u32) -> Result<(), CameraError> {
            self.calls.lock().unwrap().push("arm");
            Ok(())
        }

        fn issue_software_trigger(&mut self) -> Result<(), CameraError> {
            self.calls.lock().unwrap().push("trigger");
            Ok(())
        }

        fn poll_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>, CameraError> {
            self.calls.lock().unwrap().push("poll");
            if self.polls.len() <= 1 {
                self.stop_when_empty.request();
            }
            self.polls.remove(0)
        }

        fn disarm(&mut self) -> Result<(), CameraError> {
            self.calls.lock().unwrap().push("disarm");
            Err(CameraError::Sdk("disarm failed".to_owned()))
        }

        fn dispose(&mut self) -> Result<(), CameraError> {
            self.calls.lock().unwrap().push("dispose");
            Ok(())
        }
    }

    fn frame() -> Frame {
        Frame {
            image_buffer: vec![0; 4],
            timestamp_ns: Some(1),
            width: 2,
            height: 2,
        }
    }

    fn run(
        trigger: TriggerMode,
        polls: Vec<Result<Option<Frame>, CameraError>>,
    ) -> (Result<u64, CameraError>, Vec<&'static str>, Vec<SessionEvent>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stop = StopFlag::new();
        let camera = ScriptedCamera {
            polls,
            calls: calls.clone(),
            stop_when_empty: stop.clone(),
        };
        let config = CameraConfig {
            trigger,
            ..CameraConfig::default()
        };
        let (events, mut receiver) = events::channel(64);
        let (state, _) = watch::channel(WorkerState::Idle);

        let result = run_camera_loop(Box::new(camera), config, stop, events, state);
        let mut published = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            published.push(event);
        }
        let calls = calls.lock().unwrap().clone();
        (result, calls, published)
    }

    #[test]
    fn publishes_frames_and_tears_down_in_order() {
        let (result, calls, published) =
            run(TriggerMode::Software, vec![Ok(Some(frame())), Ok(Some(frame()))]);

        assert_eq!(result, Ok(2));
        assert_eq!(calls, vec!["arm", "trigger", "poll", "poll", "disarm", "dispose"]);
        let images = published
            .iter()
            .filter(|e| matches!(e, SessionEvent::ImageReady(_)))
            .count();
        assert_eq!(images, 2);
        // the failed disarm is reported but does not fail the loop
        assert!(published.iter().any(
            |e| matches!(e, SessionEvent::LogMessage(text) if text.contains("failed to disarm"))
        ));
    }

    #[test]
    fn empty_poll_is_fatal_in_software_mode() {
        let (result, calls, published) =
            run(TriggerMode::Software, vec![Ok(None), Ok(Some(frame()))]);

        assert!(matches!(result, Err(CameraError::FrameTimeout(_))));
        assert_eq!(calls, vec!["arm", "trigger", "poll", "disarm", "dispose"]);
        assert!(published.iter().any(|e| matches!(
            e,
            SessionEvent::WorkerExited {
                worker: Worker::Camera,
                error: Some(_)
            }
        )));
    }

    #[test]
    fn empty_poll_waits_for_pulse_in_hardware_mode() {
        let (result, calls, _) = run(TriggerMode::Hardware, vec![Ok(None), Ok(Some(frame()))]);

        assert_eq!(result, Ok(1));
        assert_eq!(calls, vec!["arm", "poll", "poll", "disarm", "dispose"]);
    }
}
