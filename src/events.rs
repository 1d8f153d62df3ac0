//! Events published by the workers to whoever observes the session.
//!
//! Publishing never blocks a worker: events go through a bounded channel with `try_send`, and
//! are dropped when the channel is full or the observer is gone.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::trace;
use uom::si::f64::{ElectricCurrent, ElectricPotential};

use crate::camera::Frame;

/// Capacity of the observer event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Worker {
    Acquisition,
    Camera,
}

/// Display values derived from one acquisition tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataSample {
    /// Seconds since session start
    pub elapsed: f64,
    /// Emitter voltage from the `voltage-read` monitor
    pub voltage: Option<ElectricPotential>,
    /// Emitter current from the first `*current*` monitor
    pub current: Option<ElectricCurrent>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    LogMessage(String),
    DataSample(DataSample),
    ImageReady(Arc<Frame>),
    /// A worker left its loop, `error` is set when it stopped on a fatal error
    WorkerExited {
        worker: Worker,
        error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    inner: Option<Sender<SessionEvent>>,
}

impl EventSender {
    /// A sender without observer, every event is discarded
    pub fn disconnected() -> Self {
        Self { inner: None }
    }

    /// Best effort publish, returns whether the event was queued
    pub fn publish(&self, event: SessionEvent) -> bool {
        let Some(sender) = &self.inner else {
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                trace!("observer channel full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn log(&self, message: impl Into<String>) -> bool {
        self.publish(SessionEvent::LogMessage(message.into()))
    }
}

pub fn channel(capacity: usize) -> (EventSender, Receiver<SessionEvent>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        EventSender {
            inner: Some(sender),
        },
        receiver,
    )
}
