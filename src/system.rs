//! Session lifecycle: starting and stopping the acquisition and camera workers, and the
//! setpoints the foreground may change at any time.

use std::fmt::{Debug, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time::{Instant, timeout_at};
use tracing::*;

use crate::acquisition::data_log::DataLogError;
use crate::acquisition::session::Session;
use crate::acquisition::{AcquisitionError, AcquisitionLoop, LoopSummary};
use crate::camera::{CameraError, CameraProvider, run_camera_loop};
use crate::config::{
    CameraConfig, ConfigurationError, SessionConfig, SessionOverrides, validate_high_time,
};
use crate::control::LoopSettings;
use crate::control::polarity::PolarityMode;
use crate::events::{EventSender, Worker};
use crate::hardware::{DaqBackend, HardwareError};
use crate::worker::{StopFlag, WorkerState};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("data log error: {0}")]
    DataLog(#[from] DataLogError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("worker task failed: {0}")]
    Join(#[from] JoinError),
}

/// Snapshot reported by [`SessionManager::status`]
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub acquisition: WorkerState,
    pub camera: WorkerState,
    pub settings: LoopSettings,
    pub data_file: Option<PathBuf>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct WorkerHandle<T, E> {
    stop: StopFlag,
    join: JoinHandle<Result<T, E>>,
}

impl<T, E: Display> WorkerHandle<T, E> {
    /// Wait for the worker to return, `None` if `deadline` passes first
    async fn finish(self, deadline: Option<Instant>) -> Option<Result<T, String>> {
        let outcome = match deadline {
            Some(deadline) => timeout_at(deadline, self.join).await.ok()?,
            None => self.join.await,
        };
        Some(match outcome {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(format!("worker task failed: {err}")),
        })
    }
}

/// Owns the workers of the current session. At most one session runs at a time.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    backend: Arc<dyn DaqBackend>,
    camera_provider: Option<Arc<dyn CameraProvider>>,
    events: EventSender,
    settings: watch::Sender<LoopSettings>,
    acquisition: Option<WorkerHandle<LoopSummary, AcquisitionError>>,
    /// Frames published by the camera worker
    camera: Option<WorkerHandle<u64, CameraError>>,
    acquisition_state: watch::Receiver<WorkerState>,
    camera_state: watch::Receiver<WorkerState>,
    data_file: Option<PathBuf>,
    last_error: Option<String>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn DaqBackend>,
        camera_provider: Option<Arc<dyn CameraProvider>>,
        events: EventSender,
    ) -> Self {
        let (settings, _) = watch::channel(LoopSettings::from_config(&config));
        Self {
            config,
            backend,
            camera_provider,
            events,
            settings,
            acquisition: None,
            camera: None,
            acquisition_state: watch::channel(WorkerState::Idle).1,
            camera_state: watch::channel(WorkerState::Idle).1,
            data_file: None,
            last_error: None,
        }
    }

    /// Whether a worker of the current session has not returned yet
    pub fn is_running(&self) -> bool {
        self.acquisition
            .as_ref()
            .is_some_and(|h| !h.join.is_finished())
            || self.camera.as_ref().is_some_and(|h| !h.join.is_finished())
    }

    /// Start a session with the configured settings
    pub async fn start_system(&mut self, with_camera: bool) -> Result<(), SessionError> {
        self.start_with(with_camera, &SessionOverrides::default()).await
    }

    /// Open the hardware and data log, start the acquisition worker and, if requested, the
    /// camera worker. `overrides` apply to this session only. Either everything starts or
    /// nothing keeps running.
    pub async fn start_with(
        &mut self,
        with_camera: bool,
        overrides: &SessionOverrides,
    ) -> Result<(), SessionError> {
        self.reap().await;
        if self.acquisition.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        // The acquisition loop stops its camera on exit, collect a camera still winding down
        if let Some(handle) = &self.camera {
            handle.stop.request();
            self.join_camera(None).await;
        }

        let config = overrides.apply(&self.config);
        let layout = config.validate()?;
        let session = {
            let config = config.clone();
            let backend = self.backend.clone();
            let path = config.storage.data_file_path(Local::now());
            task::spawn_blocking(move || Session::open(&config, layout, &*backend, &path))
                .await??
        };
        let data_file = session.data_path().map(Path::to_owned);

        let camera_stop = StopFlag::new();
        let acquisition = AcquisitionLoop::new(
            session,
            &config,
            self.settings.subscribe(),
            self.events.clone(),
        )
        .with_linked_stop(camera_stop.clone());
        let stop = StopFlag::new();
        let (state, state_rx) = watch::channel(WorkerState::Idle);
        let join = task::spawn_blocking({
            let stop = stop.clone();
            move || acquisition.run(stop, state)
        });
        self.acquisition = Some(WorkerHandle { stop, join });
        self.acquisition_state = state_rx;
        self.data_file = data_file;
        self.last_error = None;
        info!("acquisition session started");

        if with_camera {
            if let Err(err) = self.start_camera(config.camera, camera_stop).await {
                error!("camera failed to start, stopping the session: {err}");
                self.events.log(format!("Camera Error: {err}"));
                self.stop_system().await;
                self.last_error = Some(err.to_string());
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn start_camera(
        &mut self,
        camera_config: CameraConfig,
        stop: StopFlag,
    ) -> Result<(), CameraError> {
        let provider = self.camera_provider.clone().ok_or(CameraError::NoCamera)?;
        let camera = {
            let camera_config = camera_config.clone();
            task::spawn_blocking(move || provider.open(&camera_config))
                .await
                .map_err(|err| CameraError::Sdk(err.to_string()))??
        };

        let (state, state_rx) = watch::channel(WorkerState::Idle);
        let events = self.events.clone();
        let join = task::spawn_blocking({
            let stop = stop.clone();
            move || run_camera_loop(camera, camera_config, stop, events, state)
        });
        self.camera = Some(WorkerHandle { stop, join });
        self.camera_state = state_rx;
        info!("camera worker started");
        Ok(())
    }

    /// Request both workers to stop and wait for them. Stopping without a session is a no-op.
    pub async fn stop_system(&mut self) {
        if self.acquisition.is_none() && self.camera.is_none() {
            debug!("stop requested without a running session");
            return;
        }
        self.request_stop();
        self.join_workers(None).await;
        info!("session stopped");
    }

    /// Stop for application close, waiting at most `grace` for the workers.
    /// Returns the workers that did not exit in time.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<Worker> {
        self.request_stop();
        let stuck = self.join_workers(Some(Instant::now() + grace)).await;
        for worker in &stuck {
            error!("{worker:?} worker did not exit within {grace:?}");
            self.events
                .log(format!("{worker:?} worker did not exit within {grace:?}"));
        }
        stuck
    }

    fn request_stop(&self) {
        if let Some(handle) = &self.camera {
            handle.stop.request();
        }
        if let Some(handle) = &self.acquisition {
            handle.stop.request();
        }
    }

    /// Collect workers that already returned
    async fn reap(&mut self) {
        if self.camera.as_ref().is_some_and(|h| h.join.is_finished()) {
            self.join_camera(None).await;
        }
        if self
            .acquisition
            .as_ref()
            .is_some_and(|h| h.join.is_finished())
        {
            self.join_acquisition(None).await;
        }
    }

    async fn join_workers(&mut self, deadline: Option<Instant>) -> Vec<Worker> {
        let mut stuck = Vec::new();
        if !self.join_camera(deadline).await {
            stuck.push(Worker::Camera);
        }
        if !self.join_acquisition(deadline).await {
            stuck.push(Worker::Acquisition);
        }
        stuck
    }

    /// Returns false if the worker was still running at `deadline`
    async fn join_camera(&mut self, deadline: Option<Instant>) -> bool {
        match self.camera.take() {
            Some(handle) => {
                let outcome = handle.finish(deadline).await;
                self.settle(Worker::Camera, outcome)
            }
            None => true,
        }
    }

    async fn join_acquisition(&mut self, deadline: Option<Instant>) -> bool {
        match self.acquisition.take() {
            Some(handle) => {
                let outcome = handle.finish(deadline).await;
                self.settle(Worker::Acquisition, outcome)
            }
            None => true,
        }
    }

    fn settle<T: Debug>(&mut self, worker: Worker, outcome: Option<Result<T, String>>) -> bool {
        match outcome {
            Some(Ok(summary)) => {
                debug!("{worker:?} worker returned: {summary:?}");
                true
            }
            Some(Err(err)) => {
                warn!("{worker:?} worker ended with error: {err}");
                self.last_error = Some(err);
                true
            }
            None => false,
        }
    }

    pub fn set_voltage(&self, volts: f64) -> Result<(), SessionError> {
        self.config.validate_target_voltage(volts)?;
        self.settings.send_modify(|s| s.target_voltage = volts);
        info!("target voltage set to {volts} V");
        Ok(())
    }

    pub fn set_high_time(&self, seconds: f64) -> Result<(), SessionError> {
        let high_time = validate_high_time(seconds)?;
        self.settings.send_modify(|s| s.high_time = high_time);
        info!("high time set to {high_time:?}");
        Ok(())
    }

    /// Unrecognized modes are accepted: their low phase holds the output at 0 V
    pub fn set_polarity_mode(&self, mode: PolarityMode) {
        if !mode.is_recognized() {
            warn!("unrecognized polarity mode {mode:?}, the low phase will hold 0 V");
        }
        info!("polarity mode set to {mode}");
        self.settings.send_modify(|s| s.polarity_mode = mode);
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings.borrow().clone()
    }

    pub async fn status(&mut self) -> SystemStatus {
        self.reap().await;
        SystemStatus {
            acquisition: *self.acquisition_state.borrow(),
            camera: *self.camera_state.borrow(),
            settings: self.settings(),
            data_file: self.data_file.clone(),
            last_error: self.last_error.clone(),
        }
    }
}
