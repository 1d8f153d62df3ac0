use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Lifecycle of a long running worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Cooperative stop request shared between the owner and one worker.
///
/// The owner stores with `Release`, the worker loads with `Acquire` at the top of every tick,
/// so everything written before the request is visible to the worker once it sees the flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_request() {
        let owner = StopFlag::new();
        let worker = owner.clone();
        assert!(!worker.is_requested());
        owner.request();
        assert!(worker.is_requested());
    }
}
