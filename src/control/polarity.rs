use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sign/zero policy applied to the high-voltage output during the low phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolarityMode {
    /// Low phase drives the inverse of the target voltage
    Bipolar,
    /// Low phase drives 0 V
    UnipolarSwitching,
    /// Always high, no timed switching
    UnipolarConstant,
    /// A mode value that matched none of the above. Kept instead of rejected: the low phase
    /// of an unrecognized mode holds the output at 0 V and reports it.
    Unrecognized(String),
}

impl PolarityMode {
    /// Lenient parse of user input, accepts names and selector indices
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "0" | "bipolar" | "bipolar switching" => Self::Bipolar,
            "1" | "unipolar" | "unipolar switching" => Self::UnipolarSwitching,
            "2" | "constant" | "unipolar constant" => Self::UnipolarConstant,
            _ => Self::Unrecognized(raw.to_owned()),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for PolarityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolarityMode::Bipolar => f.write_str("bipolar switching"),
            PolarityMode::UnipolarSwitching => f.write_str("unipolar switching"),
            PolarityMode::UnipolarConstant => f.write_str("unipolar constant"),
            PolarityMode::Unrecognized(raw) => write!(f, "{raw}"),
        }
    }
}

impl From<String> for PolarityMode {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<PolarityMode> for String {
    fn from(mode: PolarityMode) -> Self {
        mode.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    High,
    Low,
}

impl Phase {
    fn toggled(self) -> Self {
        match self {
            Phase::High => Phase::Low,
            Phase::Low => Phase::High,
        }
    }
}

/// Dwell-time driven High/Low toggling.
///
/// Times are offsets on the loop's monotonic clock. There is no terminal state.
#[derive(Debug, Clone)]
pub struct PolarityStateMachine {
    phase: Phase,
    last_switch: Duration,
    toggles: u64,
}

impl PolarityStateMachine {
    pub fn new(now: Duration) -> Self {
        Self {
            phase: Phase::High,
            last_switch: now,
            toggles: 0,
        }
    }

    /// Evaluate the transition rule once for this tick and return the resulting phase.
    /// A zero `high_time` toggles on every call.
    pub fn update(&mut self, now: Duration, high_time: Duration, mode: &PolarityMode) -> Phase {
        if *mode == PolarityMode::UnipolarConstant {
            self.phase = Phase::High;
        } else if now.saturating_sub(self.last_switch) >= high_time {
            self.phase = self.phase.toggled();
            self.last_switch = now;
            self.toggles += 1;
        }
        self.phase
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn toggles(&self) -> u64 {
        self.toggles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the machine over `ticks` evenly spaced ticks and collect the phases
    fn run(
        machine: &mut PolarityStateMachine,
        tick: Duration,
        ticks: u32,
        high_time: Duration,
        mode: &PolarityMode,
    ) -> Vec<Phase> {
        (0..ticks)
            .map(|i| machine.update(tick * i, high_time, mode))
            .collect()
    }

    #[test]
    fn starts_high() {
        assert_eq!(PolarityStateMachine::new(Duration::ZERO).phase(), Phase::High);
    }

    #[test]
    fn bipolar_toggles_once_per_dwell() {
        let tick = Duration::from_millis(10);
        let high_time = Duration::from_millis(250);
        for k in 1..=4u32 {
            let mut machine = PolarityStateMachine::new(Duration::ZERO);
            // run for 2k * high_time
            let ticks = 2 * k * 25;
            run(&mut machine, tick, ticks, high_time, &PolarityMode::Bipolar);
            assert_eq!(machine.toggles(), u64::from(2 * k - 1), "k = {k}");
        }
    }

    #[test]
    fn phases_follow_dwell_boundaries() {
        let mut machine = PolarityStateMachine::new(Duration::ZERO);
        let phases = run(
            &mut machine,
            Duration::from_millis(100),
            30,
            Duration::from_secs(1),
            &PolarityMode::Bipolar,
        );
        assert!(phases[..10].iter().all(|p| *p == Phase::High));
        assert!(phases[10..20].iter().all(|p| *p == Phase::Low));
        assert!(phases[20..].iter().all(|p| *p == Phase::High));
    }

    #[test]
    fn unipolar_constant_never_leaves_high() {
        let mut machine = PolarityStateMachine::new(Duration::ZERO);
        let phases = run(
            &mut machine,
            Duration::from_millis(50),
            200,
            Duration::from_millis(100),
            &PolarityMode::UnipolarConstant,
        );
        assert!(phases.iter().all(|p| *p == Phase::High));
        assert_eq!(machine.toggles(), 0);
    }

    #[test]
    fn unipolar_constant_forces_high_after_low() {
        let mut machine = PolarityStateMachine::new(Duration::ZERO);
        let high_time = Duration::from_millis(100);
        machine.update(Duration::from_millis(100), high_time, &PolarityMode::Bipolar);
        assert_eq!(machine.phase(), Phase::Low);

        let phase = machine.update(
            Duration::from_millis(110),
            high_time,
            &PolarityMode::UnipolarConstant,
        );
        assert_eq!(phase, Phase::High);
    }

    #[test]
    fn zero_high_time_toggles_every_tick() {
        let mut machine = PolarityStateMachine::new(Duration::ZERO);
        let phases = run(
            &mut machine,
            Duration::from_millis(4),
            8,
            Duration::ZERO,
            &PolarityMode::UnipolarSwitching,
        );
        assert_eq!(
            phases,
            vec![
                Phase::Low,
                Phase::High,
                Phase::Low,
                Phase::High,
                Phase::Low,
                Phase::High,
                Phase::Low,
                Phase::High
            ]
        );
        assert_eq!(machine.toggles(), 8);
    }

    #[test]
    fn unrecognized_mode_still_switches() {
        let mut machine = PolarityStateMachine::new(Duration::ZERO);
        let mode = PolarityMode::parse("tripolar");
        assert_eq!(mode, PolarityMode::Unrecognized("tripolar".to_owned()));
        machine.update(Duration::from_secs(1), Duration::from_secs(1), &mode);
        assert_eq!(machine.phase(), Phase::Low);
    }

    #[test]
    fn parses_names_and_selector_indices() {
        assert_eq!(PolarityMode::parse("Bipolar switching"), PolarityMode::Bipolar);
        assert_eq!(PolarityMode::parse("0"), PolarityMode::Bipolar);
        assert_eq!(
            PolarityMode::parse("unipolar_switching"),
            PolarityMode::UnipolarSwitching
        );
        assert_eq!(PolarityMode::parse(" 2 "), PolarityMode::UnipolarConstant);
        assert!(!PolarityMode::parse("3").is_recognized());
    }
}
