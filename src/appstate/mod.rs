use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::*;

use crate::events::{DataSample, SessionEvent};
use crate::system::SessionManager;

/// Number of recent log lines kept for `GET /log`
pub const LOG_CAPACITY: usize = 200;

/// Metadata of the latest camera frame, the pixels stay with the worker
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: Option<u64>,
    /// Frames received since start-up
    pub count: u64,
}

/// All shared state involved in http communication
#[derive(Debug, Clone)]
pub struct AppState {
    /// Owner of the running session, locked for the duration of a lifecycle call
    pub manager: Arc<tokio::sync::Mutex<SessionManager>>,
    /// Latest display values from the acquisition loop
    pub latest_sample: Arc<Mutex<Option<DataSample>>>,
    /// Recent observer log lines, oldest first
    pub log: Arc<Mutex<VecDeque<String>>>,
    pub latest_frame: Arc<Mutex<Option<FrameInfo>>>,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager: Arc::new(tokio::sync::Mutex::new(manager)),
            latest_sample: Arc::new(Mutex::new(None)),
            log: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_CAPACITY))),
            latest_frame: Arc::new(Mutex::new(None)),
        }
    }

    pub fn push_log(&self, line: String) {
        if let Ok(mut log) = self.log.lock() {
            if log.len() == LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(line);
        }
    }

    /// Fold one observer event into the shared state
    pub fn apply(&self, event: SessionEvent) {
        match event {
            SessionEvent::LogMessage(line) => {
                info!(target: "session", "{line}");
                self.push_log(line);
            }
            SessionEvent::DataSample(sample) => {
                if let Ok(mut latest) = self.latest_sample.lock() {
                    *latest = Some(sample);
                }
            }
            SessionEvent::ImageReady(frame) => {
                if let Ok(mut latest) = self.latest_frame.lock() {
                    let count = latest.map_or(0, |info| info.count) + 1;
                    *latest = Some(FrameInfo {
                        width: frame.width,
                        height: frame.height,
                        timestamp_ns: frame.timestamp_ns,
                        count,
                    });
                }
            }
            SessionEvent::WorkerExited { worker, error } => {
                let line = match error {
                    Some(err) => format!("{worker:?} worker exited: {err}"),
                    None => format!("{worker:?} worker exited"),
                };
                info!("{line}");
                self.push_log(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::{EventSender, Worker};
    use crate::hardware::loopback::LoopbackBackend;

    fn state() -> AppState {
        AppState::new(SessionManager::new(
            SessionConfig::default(),
            Arc::new(LoopbackBackend::new()),
            None,
            EventSender::disconnected(),
        ))
    }

    #[test]
    fn log_ring_keeps_the_most_recent_lines() {
        let state = state();
        for n in 0..LOG_CAPACITY + 5 {
            state.apply(SessionEvent::LogMessage(format!("line {n}")));
        }

        let log = state.log.lock().unwrap();
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log.front().unwrap(), "line 5");
        assert_eq!(log.back().unwrap(), &format!("line {}", LOG_CAPACITY + 4));
    }

    #[test]
    fn worker_exit_is_logged_with_its_error() {
        let state = state();
        state.apply(SessionEvent::WorkerExited {
            worker: Worker::Acquisition,
            error: Some("device unplugged".to_owned()),
        });

        let log = state.log.lock().unwrap();
        assert_eq!(log.back().unwrap(), "Acquisition worker exited: device unplugged");
    }

    #[test]
    fn frames_are_counted() {
        let state = state();
        let frame = Arc::new(crate::camera::Frame {
            image_buffer: vec![0; 6],
            timestamp_ns: Some(42),
            width: 3,
            height: 2,
        });
        state.apply(SessionEvent::ImageReady(frame.clone()));
        state.apply(SessionEvent::ImageReady(frame));

        let info = state.latest_frame.lock().unwrap().unwrap();
        assert_eq!(info.count, 2);
        assert_eq!((info.width, info.height), (3, 2));
        assert_eq!(info.timestamp_ns, Some(42));
    }
}
