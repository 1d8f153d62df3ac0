//! Session configuration.
//!
//! Loaded from `espray.toml` and overridden by `ESPRAY_`-prefixed environment variables
//! (`__` separates nested keys, e.g. `ESPRAY_DAQ__SAMPLE_PERIOD=20ms`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::camera::TriggerMode;
use crate::channel::{ChannelMap, ChannelName, ChannelType, VOLTAGE_CONTROL};
use crate::control::polarity::PolarityMode;

pub const CONFIG_FILE: &str = "espray.toml";
pub const ENV_PREFIX: &str = "ESPRAY_";

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("malformed {kind} channel list {list:?}: {token:?} is not a channel index")]
    MalformedChannelList {
        kind: ChannelType,
        token: String,
        list: String,
    },
    #[error("{kind} channel {index} is requested more than once")]
    DuplicateChannel { kind: ChannelType, index: u32 },
    #[error("{kind}{index} is named both {first:?} and {second:?}")]
    DuplicateLogicalIndex {
        kind: ChannelType,
        index: u32,
        first: String,
        second: String,
    },
    #[error("invalid {kind} device name {name:?}")]
    InvalidDeviceName { kind: ChannelType, name: String },
    #[error("sample period must be greater than zero")]
    InvalidSamplePeriod,
    #[error("invalid {what} range [{min}, {max}]")]
    InvalidRange {
        what: &'static str,
        min: f64,
        max: f64,
    },
    #[error("target voltage {volts} V is outside the allowed range [{min}, {max}] V")]
    VoltageOutOfRange { volts: f64, min: f64, max: f64 },
    #[error("high time must be a finite, non-negative number of seconds, got {0}")]
    InvalidHighTime(f64),
    #[error("amplifier scale factor must be finite and non-zero, got {0}")]
    InvalidScaleFactor(f64),
    #[error("camera trigger period must be greater than zero")]
    InvalidTriggerPeriod,
    #[error("camera frame rate must be a positive number of frames per second, got {0}")]
    InvalidFrameRate(f64),
    #[error("camera region of interest {0:?} has an empty edge")]
    InvalidRoi([u32; 2]),
    #[error("unable to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Inclusive voltage range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltRange {
    pub min: f64,
    pub max: f64,
}

impl VoltRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn validate(&self, what: &'static str) -> Result<(), ConfigurationError> {
        if self.min.is_finite() && self.max.is_finite() && self.min < self.max {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidRange {
                what,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Everything needed to start a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub daq: DaqConfig,
    pub amplifier: AmplifierConfig,
    pub polarity: PolarityConfig,
    pub camera: CameraConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            daq: DaqConfig::default(),
            amplifier: AmplifierConfig::default(),
            polarity: PolarityConfig::default(),
            camera: CameraConfig::default(),
            storage: StorageConfig::default(),
            http: HttpConfig::default(),
            log_level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub input_device: String,
    pub output_device: String,
    /// Comma separated physical input indices
    pub input_channels: String,
    /// Comma separated physical output indices
    pub output_channels: String,
    pub input_names: HashMap<ChannelName, u32>,
    pub output_names: HashMap<ChannelName, u32>,
    pub input_range: VoltRange,
    pub output_range: VoltRange,
    /// Time between acquisition ticks
    #[serde(with = "humantime_serde")]
    pub sample_period: Duration,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            input_device: "cDAQ9185-2023AF4Mod1".to_owned(),
            output_device: "cDAQ9185-2023AF4Mod2".to_owned(),
            input_channels: "0, 1".to_owned(),
            output_channels: "0, 1".to_owned(),
            input_names: HashMap::from([
                ("voltage-read".to_owned(), 0),
                ("current-read".to_owned(), 1),
            ]),
            output_names: HashMap::from([
                ("voltage-control".to_owned(), 0),
                ("camera-trigger".to_owned(), 1),
            ]),
            input_range: VoltRange::new(-10.0, 10.0),
            output_range: VoltRange::new(-10.0, 10.0),
            sample_period: Duration::from_millis(40),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplifierConfig {
    /// Amplifier gain, volts out per control volt in
    pub scale_factor: f64,
    /// Volts at the emitter per volt on the voltage monitor input
    pub voltage_monitor_scale: f64,
    /// Amperes per volt on the current monitor input
    pub current_monitor_scale: f64,
    pub target_voltage_range: VoltRange,
}

impl Default for AmplifierConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1000.0,
            voltage_monitor_scale: 1000.0,
            current_monitor_scale: 1e-3,
            target_voltage_range: VoltRange::new(-5000.0, 5000.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolarityConfig {
    /// Dwell time of each phase in seconds
    pub high_time: f64,
    pub mode: PolarityMode,
    pub target_voltage: f64,
}

impl Default for PolarityConfig {
    fn default() -> Self {
        Self {
            high_time: 1.0,
            mode: PolarityMode::Bipolar,
            target_voltage: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub trigger: TriggerMode,
    pub buffer_depth: u32,
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    pub frame_rate: f64,
    pub roi: [u32; 2],
    /// Period of the square pulse on the `camera-trigger` output
    #[serde(with = "humantime_serde")]
    pub trigger_period: Duration,
    pub trigger_level: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerMode::Software,
            buffer_depth: 10,
            poll_timeout: Duration::from_secs(2),
            frame_rate: 10.0,
            roi: [4096, 3000],
            trigger_period: Duration::from_millis(100),
            trigger_level: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            file_prefix: "ESPRAY".to_owned(),
        }
    }
}

impl StorageConfig {
    /// Data log path for a session started at `started`
    pub fn data_file_path(&self, started: DateTime<Local>) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}_DATA.csv",
            self.file_prefix,
            started.format("%Y-%m-%d_%H%M%S")
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    /// How long application close waits for running workers
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_owned(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Settings a single session may override when it starts. Unset fields keep the configured
/// value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOverrides {
    pub output_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub sample_period: Option<Duration>,
    pub frame_rate: Option<f64>,
    pub roi: Option<[u32; 2]>,
}

impl SessionOverrides {
    /// `base` with these overrides applied. The result still has to be validated.
    pub fn apply(&self, base: &SessionConfig) -> SessionConfig {
        let mut config = base.clone();
        if let Some(dir) = &self.output_dir {
            config.storage.output_dir = dir.clone();
        }
        if let Some(period) = self.sample_period {
            config.daq.sample_period = period;
        }
        if let Some(rate) = self.frame_rate {
            config.camera.frame_rate = rate;
        }
        if let Some(roi) = self.roi {
            config.camera.roi = roi;
        }
        config
    }
}

/// Channel maps for both kinds, built once at session start
#[derive(Debug, Clone)]
pub struct ChannelLayout {
    pub inputs: ChannelMap,
    pub outputs: ChannelMap,
}

impl SessionConfig {
    /// Load configuration from `espray.toml` and the environment
    pub fn load() -> Result<Self, ConfigurationError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific file path; a missing file leaves the defaults in place
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        Self::extract(
            Figment::from(Serialized::defaults(SessionConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse configuration from TOML text on top of the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigurationError> {
        Self::extract(
            Figment::from(Serialized::defaults(SessionConfig::default()))
                .merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigurationError> {
        figment
            .extract()
            .map_err(|e| ConfigurationError::Load(Box::new(e)))
    }

    /// Check everything that can be checked before touching hardware and build the channel maps
    pub fn validate(&self) -> Result<ChannelLayout, ConfigurationError> {
        let daq = &self.daq;

        let inputs = ChannelMap::build(
            ChannelType::Input,
            &ChannelMap::parse_indices(ChannelType::Input, &daq.input_channels)?,
            &daq.input_names,
        )?;
        let outputs = ChannelMap::build(
            ChannelType::Output,
            &ChannelMap::parse_indices(ChannelType::Output, &daq.output_channels)?,
            &daq.output_names,
        )?;

        if !inputs.is_empty() {
            validate_device_name(ChannelType::Input, &daq.input_device)?;
        }
        if !outputs.is_empty() {
            validate_device_name(ChannelType::Output, &daq.output_device)?;
        }

        if daq.sample_period.is_zero() {
            return Err(ConfigurationError::InvalidSamplePeriod);
        }
        daq.input_range.validate("input")?;
        daq.output_range.validate("output")?;

        let amplifier = &self.amplifier;
        if !amplifier.scale_factor.is_finite() || amplifier.scale_factor == 0.0 {
            return Err(ConfigurationError::InvalidScaleFactor(
                amplifier.scale_factor,
            ));
        }
        amplifier.target_voltage_range.validate("target voltage")?;

        self.validate_target_voltage(self.polarity.target_voltage)?;
        validate_high_time(self.polarity.high_time)?;
        if !self.polarity.mode.is_recognized() {
            warn!(
                "unrecognized polarity mode {:?}, the low phase will hold 0 V",
                self.polarity.mode.to_string()
            );
        }

        let camera = &self.camera;
        if camera.trigger_period.is_zero() {
            return Err(ConfigurationError::InvalidTriggerPeriod);
        }
        if !camera.frame_rate.is_finite() || camera.frame_rate <= 0.0 {
            return Err(ConfigurationError::InvalidFrameRate(camera.frame_rate));
        }
        if camera.roi.contains(&0) {
            return Err(ConfigurationError::InvalidRoi(camera.roi));
        }

        if outputs.index_of(VOLTAGE_CONTROL).is_none() {
            warn!("no {VOLTAGE_CONTROL} output is configured, the amplifier will not be driven");
        }

        Ok(ChannelLayout { inputs, outputs })
    }

    pub fn validate_target_voltage(&self, volts: f64) -> Result<(), ConfigurationError> {
        let range = self.amplifier.target_voltage_range;
        if range.contains(volts) {
            Ok(())
        } else {
            Err(ConfigurationError::VoltageOutOfRange {
                volts,
                min: range.min,
                max: range.max,
            })
        }
    }
}

pub fn validate_high_time(seconds: f64) -> Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigurationError::InvalidHighTime(seconds))
}

fn validate_device_name(kind: ChannelType, name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(ConfigurationError::InvalidDeviceName {
            kind,
            name: name.to_owned(),
        });
    }
    Ok(())
}
