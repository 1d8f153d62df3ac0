//! The fixed-rate acquisition loop.
//!
//! Every tick updates the polarity phase, writes the output vector, reads the inputs, appends a
//! row to the data log and publishes display values. The loop owns its [`Session`] and tears it
//! down on every exit path.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::*;
use uom::si::electric_current::ampere;
use uom::si::electric_potential::volt;
use uom::si::f64::{ElectricCurrent, ElectricPotential};

use crate::channel::{CURRENT_MARKER, VOLTAGE_READ};
use crate::config::SessionConfig;
use crate::control::LoopSettings;
use crate::control::output::OutputCalculator;
use crate::control::polarity::{Phase, PolarityStateMachine};
use crate::events::{DataSample, EventSender, SessionEvent, Worker};
use crate::hardware::HardwareError;
use crate::worker::{StopFlag, WorkerState};

pub mod data_log;
pub mod session;

use data_log::DataLogError;
use session::Session;

/// After the first overrun, only every n-th one is reported
pub const OVERRUN_REPORT_EVERY: u64 = 100;

/// Errors that end a running acquisition loop
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("data log error: {0}")]
    DataLog(#[from] DataLogError),
}

/// Counters of a loop that ended on a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopSummary {
    pub ticks: u64,
    pub overruns: u64,
}

/// Outcome of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub phase: Phase,
    pub inputs: Vec<f64>,
    pub outputs: Vec<f64>,
    pub sample: DataSample,
}

/// Result of scheduling the next tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Time left until the next deadline
    Sleep(Duration),
    /// The tick finished this late; the schedule restarts from now
    Overrun(Duration),
}

/// Fixed deadlines spaced one period apart. An overrun moves the schedule instead of bursting
/// ticks to catch up.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    period: Duration,
    deadline: Instant,
}

impl TickSchedule {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            period,
            deadline: start,
        }
    }

    /// Advance to the deadline following the tick that finished at `now`
    pub fn advance(&mut self, now: Instant) -> Slot {
        self.deadline += self.period;
        if now > self.deadline {
            let late = now - self.deadline;
            self.deadline = now;
            Slot::Overrun(late)
        } else {
            Slot::Sleep(self.deadline - now)
        }
    }
}

pub struct AcquisitionLoop {
    session: Session,
    settings: watch::Receiver<LoopSettings>,
    events: EventSender,
    calculator: OutputCalculator,
    polarity: PolarityStateMachine,
    period: Duration,
    /// Positions of the display inputs within a read
    voltage_at: Option<usize>,
    current_at: Option<usize>,
    voltage_scale: f64,
    current_scale: f64,
    /// Diagnostic of the current streak, reported once
    last_diagnostic: Option<String>,
    /// Requested whenever the loop ends, whatever the reason
    linked_stop: Option<StopFlag>,
    ticks: u64,
    overruns: u64,
}

impl AcquisitionLoop {
    pub fn new(
        session: Session,
        config: &SessionConfig,
        settings: watch::Receiver<LoopSettings>,
        events: EventSender,
    ) -> Self {
        let inputs = &session.layout().inputs;
        let voltage_at = inputs.position_where(|name| name == VOLTAGE_READ);
        let current_at = inputs.position_where(|name| name.contains(CURRENT_MARKER));

        Self {
            voltage_at,
            current_at,
            session,
            settings,
            events,
            calculator: OutputCalculator::from_config(config),
            polarity: PolarityStateMachine::new(Duration::ZERO),
            period: config.daq.sample_period,
            voltage_scale: config.amplifier.voltage_monitor_scale,
            current_scale: config.amplifier.current_monitor_scale,
            last_diagnostic: None,
            linked_stop: None,
            ticks: 0,
            overruns: 0,
        }
    }

    /// Stop another worker together with this loop, e.g. the camera of the same session
    pub fn with_linked_stop(mut self, stop: StopFlag) -> Self {
        self.linked_stop = Some(stop);
        self
    }

    /// Run one tick at `now`, the time since session start
    pub fn tick(&mut self, now: Duration) -> Result<TickRecord, AcquisitionError> {
        let settings = self.settings.borrow().clone();

        let previous = self.polarity.phase();
        let phase = self
            .polarity
            .update(now, settings.high_time, &settings.polarity_mode);
        if phase != previous {
            debug!(
                "polarity {:?} -> {:?} at {:.3} s (toggle {})",
                previous,
                phase,
                now.as_secs_f64(),
                self.polarity.toggles()
            );
        }

        let outputs = self.calculator.compute(
            &self.session.layout().outputs,
            phase,
            &settings.polarity_mode,
            settings.target_voltage,
            now,
        );
        self.report_diagnostics(&outputs.diagnostics);

        self.session.write_outputs(&outputs.values)?;
        let inputs = self.session.read_inputs()?;
        self.session.append_row(now, &inputs, &outputs.values)?;

        let sample = self.sample(now, &inputs);
        self.events.publish(SessionEvent::DataSample(sample));
        self.ticks += 1;

        Ok(TickRecord {
            phase,
            inputs,
            outputs: outputs.values,
            sample,
        })
    }

    /// Tick until `stop` is requested or a tick fails, then tear the session down
    pub fn run(
        mut self,
        stop: StopFlag,
        state: watch::Sender<WorkerState>,
    ) -> Result<LoopSummary, AcquisitionError> {
        state.send_replace(WorkerState::Running);
        if let Some(path) = self.session.data_path() {
            info!("acquisition running, logging to '{}'", path.display());
            self.events
                .log(format!("Acquisition: Logging to {}", path.display()));
        }

        let started = Instant::now();
        let mut schedule = TickSchedule::new(started, self.period);
        let result = loop {
            if stop.is_requested() {
                break Ok(());
            }
            if let Err(err) = self.tick(started.elapsed()) {
                break Err(err);
            }
            match schedule.advance(Instant::now()) {
                Slot::Sleep(remaining) => thread::sleep(remaining),
                Slot::Overrun(late) => self.report_overrun(late),
            }
        };

        state.send_replace(WorkerState::Stopping);
        if let Some(linked) = &self.linked_stop {
            linked.request();
        }
        if let Err(err) = &result {
            error!("acquisition stopped on error: {err}");
            self.events.log(format!("Acquisition Error: {err}"));
        }

        for err in self.session.teardown() {
            self.events.log(format!("Acquisition: teardown: {err}"));
        }
        if self.overruns > 0 {
            warn!(
                "{} of {} ticks overran the {:?} sample period",
                self.overruns, self.ticks, self.period
            );
        }
        info!("acquisition finished after {} ticks", self.ticks);
        self.events.log(format!(
            "Acquisition: Stopped after {} ticks ({} overruns).",
            self.ticks, self.overruns
        ));

        state.send_replace(WorkerState::Stopped);
        self.events.publish(SessionEvent::WorkerExited {
            worker: Worker::Acquisition,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result.map(|()| LoopSummary {
            ticks: self.ticks,
            overruns: self.overruns,
        })
    }

    fn sample(&self, now: Duration, inputs: &[f64]) -> DataSample {
        DataSample {
            elapsed: now.as_secs_f64(),
            voltage: self
                .voltage_at
                .and_then(|pos| inputs.get(pos))
                .map(|raw| ElectricPotential::new::<volt>(raw * self.voltage_scale)),
            current: self
                .current_at
                .and_then(|pos| inputs.get(pos))
                .map(|raw| ElectricCurrent::new::<ampere>(raw * self.current_scale)),
        }
    }

    fn report_diagnostics(&mut self, diagnostics: &[String]) {
        if diagnostics.is_empty() {
            self.last_diagnostic = None;
            return;
        }
        let message = diagnostics.join("; ");
        if self.last_diagnostic.as_deref() != Some(message.as_str()) {
            warn!("{message}");
            self.events.log(format!("Acquisition: {message}"));
            self.last_diagnostic = Some(message);
        }
    }

    fn report_overrun(&mut self, late: Duration) {
        self.overruns += 1;
        if self.overruns == 1 || self.overruns % OVERRUN_REPORT_EVERY == 0 {
            warn!(
                "tick {} overran the sample period by {:?} ({} overruns)",
                self.ticks, late, self.overruns
            );
            self.events.log(format!(
                "Acquisition: tick overran by {:.1} ms ({} overruns so far)",
                late.as_secs_f64() * 1e3,
                self.overruns
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tokio::sync::mpsc::Receiver;

    use super::*;
    use crate::channel::VOLTAGE_CONTROL;
    use crate::control::polarity::PolarityMode;
    use crate::events;
    use crate::hardware::loopback::LoopbackBackend;

    struct Rig {
        backend: LoopbackBackend,
        settings: watch::Sender<LoopSettings>,
        receiver: Receiver<SessionEvent>,
        acquisition: AcquisitionLoop,
    }

    fn names(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries.iter().map(|(n, i)| (n.to_string(), *i)).collect()
    }

    /// 2500 V bipolar, 1 s dwell, gain 1000, 100 ms ticks
    fn scenario() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.daq.output_channels = "0".to_owned();
        config.daq.output_names = names(&[(VOLTAGE_CONTROL, 0)]);
        config.daq.input_channels = "0".to_owned();
        config.daq.input_names = names(&[(VOLTAGE_READ, 0)]);
        config.daq.sample_period = Duration::from_millis(100);
        config.polarity.target_voltage = 2500.0;
        config.polarity.high_time = 1.0;
        config.polarity.mode = PolarityMode::Bipolar;
        config
    }

    fn rig(config: &SessionConfig, path: &Path) -> Rig {
        let backend = LoopbackBackend::new();
        let session =
            Session::open(config, config.validate().unwrap(), &backend, path).unwrap();
        let (settings, settings_rx) = watch::channel(LoopSettings::from_config(config));
        let (events, receiver) = events::channel(4096);
        Rig {
            acquisition: AcquisitionLoop::new(session, config, settings_rx, events),
            backend,
            settings,
            receiver,
        }
    }

    fn at(tick: u64) -> Duration {
        Duration::from_millis(100 * tick)
    }

    fn log_lines(receiver: &mut Receiver<SessionEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let SessionEvent::LogMessage(line) = event {
                lines.push(line);
            }
        }
        lines
    }

    #[test]
    fn bipolar_scenario_alternates_sign_every_second() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&scenario(), &dir.path().join("run.csv"));

        let outputs: Vec<f64> = (0..30)
            .map(|tick| rig.acquisition.tick(at(tick)).unwrap().outputs[0])
            .collect();

        assert!(outputs[..10].iter().all(|v| *v == 2.5));
        assert!(outputs[10..20].iter().all(|v| *v == -2.5));
        assert!(outputs[20..].iter().all(|v| *v == 2.5));
    }

    #[test]
    fn inputs_read_back_and_scale_to_display_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&scenario(), &dir.path().join("run.csv"));

        let record = rig.acquisition.tick(at(0)).unwrap();
        assert_eq!(record.inputs, vec![2.5]);
        assert_eq!(
            record.sample.voltage.map(|v| v.get::<volt>()),
            Some(2500.0)
        );
        assert_eq!(record.sample.current, None);
        assert!(matches!(
            rig.receiver.try_recv(),
            Ok(SessionEvent::DataSample(sample)) if sample == record.sample
        ));
    }

    #[test]
    fn loopback_preserves_output_order() {
        let mut config = scenario();
        config.daq.output_channels = "2, 0, 1".to_owned();
        config.daq.output_names = names(&[(VOLTAGE_CONTROL, 1)]);
        config.daq.input_channels = "0, 1, 2".to_owned();
        config.daq.input_names = HashMap::new();
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&config, &dir.path().join("run.csv"));

        let record = rig.acquisition.tick(at(0)).unwrap();
        assert_eq!(record.outputs, vec![0.0, 2.5, 0.0]);
        assert_eq!(record.inputs, record.outputs);
    }

    #[test]
    fn unmapped_output_holds_zero_and_is_labelled_unknown() {
        let mut config = scenario();
        config.daq.output_channels = "0, 2".to_owned();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut rig = rig(&config, &path);

        for tick in 0..25 {
            assert_eq!(rig.acquisition.tick(at(tick)).unwrap().outputs[1], 0.0);
        }
        drop(rig);

        let contents = fs::read_to_string(&path).unwrap();
        let header = contents.lines().next().unwrap();
        assert_eq!(
            header,
            "Timestamp,voltage-read (AI0),voltage-control (AO0),Unknown (AO2)"
        );
    }

    #[test]
    fn every_row_has_one_column_per_channel_plus_timestamp() {
        let mut config = SessionConfig::default();
        config.daq.output_channels = "0, 1, 3".to_owned();
        config.daq.input_channels = "0, 1".to_owned();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut rig = rig(&config, &path);
        for tick in 0..5 {
            rig.acquisition.tick(at(tick)).unwrap();
        }
        drop(rig);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().len(), 6);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|row| row.len() == 6));
        assert_eq!(&rows[1][0], "0.100000");
    }

    #[test]
    fn setpoint_changes_apply_on_the_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&scenario(), &dir.path().join("run.csv"));
        assert_eq!(rig.acquisition.tick(at(0)).unwrap().outputs, vec![2.5]);

        rig.settings.send_modify(|s| s.target_voltage = 1000.0);
        assert_eq!(rig.acquisition.tick(at(1)).unwrap().outputs, vec![1.0]);

        rig.settings
            .send_modify(|s| s.polarity_mode = PolarityMode::UnipolarConstant);
        for tick in 2..40 {
            let record = rig.acquisition.tick(at(tick)).unwrap();
            assert_eq!(record.phase, Phase::High);
        }
    }

    #[test]
    fn unrecognized_mode_is_reported_once_per_low_phase() {
        let mut config = scenario();
        config.polarity.mode = PolarityMode::parse("sideways");
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&config, &dir.path().join("run.csv"));

        for tick in 0..40 {
            let record = rig.acquisition.tick(at(tick)).unwrap();
            if record.phase == Phase::Low {
                assert_eq!(record.outputs, vec![0.0]);
            }
        }

        let reports = log_lines(&mut rig.receiver)
            .into_iter()
            .filter(|line| line.contains("no low phase policy"))
            .count();
        assert_eq!(reports, 2);
    }

    #[test]
    fn schedule_restarts_after_an_overrun() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(start, Duration::from_millis(40));

        assert_eq!(
            schedule.advance(start + Duration::from_millis(10)),
            Slot::Sleep(Duration::from_millis(30))
        );
        assert_eq!(
            schedule.advance(start + Duration::from_millis(140)),
            Slot::Overrun(Duration::from_millis(60))
        );
        assert_eq!(
            schedule.advance(start + Duration::from_millis(150)),
            Slot::Sleep(Duration::from_millis(30))
        );
    }

    #[test]
    fn overruns_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&scenario(), &dir.path().join("run.csv"));
        for _ in 0..250 {
            rig.acquisition.report_overrun(Duration::from_millis(5));
        }

        assert_eq!(rig.acquisition.overruns, 250);
        assert_eq!(log_lines(&mut rig.receiver).len(), 3);
    }

    #[test]
    fn hardware_error_stops_the_loop_and_tears_down() {
        let mut config = scenario();
        config.daq.sample_period = Duration::from_millis(1);
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(&config, &dir.path().join("run.csv"));
        // the zeroing write at open plus three ticks succeed
        rig.backend.state().fail_write_after = Some(4);
        let (state, state_rx) = watch::channel(WorkerState::Idle);
        let camera_stop = StopFlag::new();

        let result = rig
            .acquisition
            .with_linked_stop(camera_stop.clone())
            .run(StopFlag::new(), state);

        assert!(matches!(
            result,
            Err(AcquisitionError::Hardware(HardwareError::Disconnected { .. }))
        ));
        assert_eq!(*state_rx.borrow(), WorkerState::Stopped);
        assert!(camera_stop.is_requested());

        let backend = rig.backend.state();
        assert_eq!(backend.writes.len(), 4);
        assert!(backend.calls.ends_with(&["close AO".to_owned(), "close AI".to_owned()]));

        let mut exited = None;
        while let Ok(event) = rig.receiver.try_recv() {
            if let SessionEvent::WorkerExited { worker, error } = event {
                exited = Some((worker, error));
            }
        }
        let (worker, error) = exited.unwrap();
        assert_eq!(worker, Worker::Acquisition);
        assert!(error.unwrap().contains("disconnect"));
    }

    #[test]
    fn stop_request_ends_the_loop_with_outputs_zeroed() {
        let mut config = scenario();
        config.daq.sample_period = Duration::from_millis(5);
        let dir = tempfile::tempdir().unwrap();
        let rig = rig(&config, &dir.path().join("run.csv"));
        let stop = StopFlag::new();
        let (state, mut state_rx) = watch::channel(WorkerState::Idle);

        let worker = {
            let stop = stop.clone();
            let acquisition = rig.acquisition;
            thread::spawn(move || acquisition.run(stop, state))
        };
        while *state_rx.borrow_and_update() != WorkerState::Running {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));
        stop.request();
        let summary = worker.join().unwrap().unwrap();

        assert!(summary.ticks > 0);
        assert_eq!(*state_rx.borrow(), WorkerState::Stopped);
        let backend = rig.backend.state();
        assert_eq!(backend.outputs, vec![0.0]);
        assert_eq!(backend.writes.len() as u64, summary.ticks + 2);
    }

    /// Run the loop on its own thread and wait until it has started
    fn spawn(
        acquisition: AcquisitionLoop,
        stop: &StopFlag,
    ) -> thread::JoinHandle<Result<LoopSummary, AcquisitionError>> {
        let (state, mut state_rx) = watch::channel(WorkerState::Idle);
        let worker = {
            let stop = stop.clone();
            thread::spawn(move || acquisition.run(stop, state))
        };
        while *state_rx.borrow_and_update() == WorkerState::Idle {
            thread::sleep(Duration::from_millis(1));
        }
        worker
    }

    #[test]
    fn ticks_follow_the_sample_period() {
        let mut config = scenario();
        config.daq.sample_period = Duration::from_millis(10);
        let dir = tempfile::tempdir().unwrap();
        let rig = rig(&config, &dir.path().join("run.csv"));
        let stop = StopFlag::new();

        let started = Instant::now();
        let worker = spawn(rig.acquisition, &stop);
        thread::sleep(Duration::from_millis(300));
        stop.request();
        let summary = worker.join().unwrap().unwrap();
        let periods = (started.elapsed().as_millis() / 10) as u64;

        assert!(summary.ticks <= periods + 2, "{summary:?} in {periods} periods");
        assert!(summary.ticks >= periods / 2, "{summary:?} in {periods} periods");
    }

    #[test]
    fn slow_ticks_do_not_cause_a_catch_up_burst() {
        let mut config = scenario();
        config.daq.sample_period = Duration::from_millis(10);
        let dir = tempfile::tempdir().unwrap();
        let rig = rig(&config, &dir.path().join("run.csv"));
        rig.backend.state().read_delay = Some(Duration::from_millis(40));
        let stop = StopFlag::new();

        let worker = spawn(rig.acquisition, &stop);
        thread::sleep(Duration::from_millis(120));
        let (reads_before, recovered) = {
            let mut backend = rig.backend.state();
            backend.read_delay = None;
            (backend.reads, Instant::now())
        };
        thread::sleep(Duration::from_millis(100));
        let (reads_after, elapsed) = {
            let backend = rig.backend.state();
            (backend.reads, recovered.elapsed())
        };
        stop.request();
        let summary = worker.join().unwrap().unwrap();

        // one slow read may still be in flight when the delay is cleared
        let periods = (elapsed.as_millis() / 10) as usize;
        assert!(
            reads_after - reads_before <= periods + 3,
            "{} reads in {periods} periods",
            reads_after - reads_before
        );
        assert!(summary.overruns >= 1);
    }
}
