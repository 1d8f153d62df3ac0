use std::time::Duration;

use crate::channel::{CAMERA_TRIGGER, ChannelMap, VOLTAGE_CONTROL};
use crate::config::SessionConfig;
use crate::control::polarity::{Phase, PolarityMode};

/// Output values for one tick, aligned 1:1 with the output channel map
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outputs {
    pub values: Vec<f64>,
    /// Reportable conditions met while computing `values`
    pub diagnostics: Vec<String>,
}

/// Maps the polarity phase and target voltage onto the configured output channels
#[derive(Debug, Clone)]
pub struct OutputCalculator {
    /// Amplifier gain, volts out per control volt in
    scale_factor: f64,
    trigger_period: Duration,
    trigger_level: f64,
}

impl OutputCalculator {
    pub fn new(scale_factor: f64, trigger_period: Duration, trigger_level: f64) -> Self {
        Self {
            scale_factor,
            trigger_period,
            trigger_level,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.amplifier.scale_factor,
            config.camera.trigger_period,
            config.camera.trigger_level,
        )
    }

    pub fn compute(
        &self,
        outputs: &ChannelMap,
        phase: Phase,
        mode: &PolarityMode,
        target_voltage: f64,
        now: Duration,
    ) -> Outputs {
        let mut diagnostics = Vec::new();
        let values = outputs
            .channels()
            .iter()
            .map(|channel| match channel.name.as_str() {
                VOLTAGE_CONTROL => {
                    let control = target_voltage / self.scale_factor;
                    match (phase, mode) {
                        (Phase::High, _) => control,
                        (Phase::Low, PolarityMode::Bipolar) => -control,
                        (Phase::Low, PolarityMode::UnipolarSwitching) => 0.0,
                        (Phase::Low, other) => {
                            diagnostics.push(format!(
                                "polarity mode {:?} has no low phase policy, holding {} (AO{}) at 0 V",
                                other.to_string(),
                                VOLTAGE_CONTROL,
                                channel.index
                            ));
                            0.0
                        }
                    }
                }
                CAMERA_TRIGGER => self.camera_trigger(now),
                _ => 0.0,
            })
            .collect();

        Outputs {
            values,
            diagnostics,
        }
    }

    /// Square pulse: trigger level for the first half of each period, 0 V for the second
    pub fn camera_trigger(&self, now: Duration) -> f64 {
        let period = self.trigger_period.as_nanos();
        if period == 0 {
            return 0.0;
        }
        if now.as_nanos() % period < period / 2 {
            self.trigger_level
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::channel::ChannelType;

    fn outputs(entries: &[(&str, u32)], requested: &[u32]) -> ChannelMap {
        let names: HashMap<String, u32> = entries
            .iter()
            .map(|(name, index)| (name.to_string(), *index))
            .collect();
        ChannelMap::build(ChannelType::Output, requested, &names).unwrap()
    }

    fn calculator() -> OutputCalculator {
        OutputCalculator::new(1000.0, Duration::from_millis(100), 5.0)
    }

    #[test]
    fn high_phase_scales_target_voltage() {
        let map = outputs(&[(VOLTAGE_CONTROL, 0)], &[0]);
        let out = calculator().compute(
            &map,
            Phase::High,
            &PolarityMode::Bipolar,
            2500.0,
            Duration::ZERO,
        );
        assert_eq!(out.values, vec![2.5]);
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn low_phase_follows_mode_policy() {
        let map = outputs(&[(VOLTAGE_CONTROL, 0)], &[0]);
        let calc = calculator();
        let low = |mode: &PolarityMode| {
            calc.compute(&map, Phase::Low, mode, 2500.0, Duration::ZERO)
        };

        assert_eq!(low(&PolarityMode::Bipolar).values, vec![-2.5]);
        assert_eq!(low(&PolarityMode::UnipolarSwitching).values, vec![0.0]);

        let unrecognized = low(&PolarityMode::parse("tripolar"));
        assert_eq!(unrecognized.values, vec![0.0]);
        assert_eq!(unrecognized.diagnostics.len(), 1);
        assert!(unrecognized.diagnostics[0].contains("tripolar"));
    }

    #[test]
    fn unmapped_channels_are_held_at_zero() {
        let map = outputs(&[(VOLTAGE_CONTROL, 0)], &[0, 2]);
        let out = calculator().compute(
            &map,
            Phase::High,
            &PolarityMode::Bipolar,
            1000.0,
            Duration::from_millis(3),
        );
        assert_eq!(out.values, vec![1.0, 0.0]);
    }

    #[test]
    fn camera_trigger_is_a_half_duty_square_wave() {
        let calc = calculator();
        assert_eq!(calc.camera_trigger(Duration::from_millis(0)), 5.0);
        assert_eq!(calc.camera_trigger(Duration::from_millis(49)), 5.0);
        assert_eq!(calc.camera_trigger(Duration::from_millis(50)), 0.0);
        assert_eq!(calc.camera_trigger(Duration::from_millis(99)), 0.0);
        assert_eq!(calc.camera_trigger(Duration::from_millis(1_020)), 5.0);
    }

    #[test]
    fn camera_trigger_ignores_polarity_phase() {
        let map = outputs(&[(VOLTAGE_CONTROL, 0), (CAMERA_TRIGGER, 1)], &[1, 0]);
        let calc = calculator();
        let now = Duration::from_millis(10);
        let high = calc.compute(&map, Phase::High, &PolarityMode::Bipolar, 100.0, now);
        let low = calc.compute(&map, Phase::Low, &PolarityMode::Bipolar, 100.0, now);
        assert_eq!(high.values[1], 5.0);
        assert_eq!(low.values[1], 5.0);
        assert_eq!(high.values[0], -low.values[0]);
    }
}
