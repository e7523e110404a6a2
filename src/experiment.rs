//! Per-run experiment parameters.
//!
//! An [`ExperimentConfig`] fully describes one fluorescence-induction run:
//! LED intensities, the four protocol intervals, the acquisition rate and
//! window, and where the waveform is saved. It is immutable once a run
//! starts.
//!
//! Two entry points exist for values coming from outside:
//!
//! - [`ExperimentConfig::clamped`] coerces every field into its valid range
//!   and fixes the file suffix, for operator-entered values.
//! - [`ExperimentConfig::validate`] rejects anything out of range. The
//!   protocol orchestrator always calls this before touching hardware.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::timeline::Step;

/// Acquisition time recorded ahead of the protocol proper.
pub const PRE_BUFFER_S: f64 = 0.1;

/// Delay between the green LED switching off and the acquisition stopping,
/// so the switch-off transient is captured.
pub const END_RECORDING_OFFSET_S: f64 = 0.025;

/// Lowest supported sample rate.
pub const MIN_RECORDING_HZ: u32 = 1_000;

/// Highest supported sample rate.
pub const MAX_RECORDING_HZ: u32 = 1_000_000;

/// Longest allowed protocol interval.
pub const MAX_STEP_DURATION_S: f64 = 10.0;

/// Longest allowed recording window.
pub const MAX_RECORDING_LENGTH_S: f64 = 600.0;

/// Largest allowed scheduling tolerance.
pub const MAX_ACTION_EPSILON_S: f64 = 0.1;

/// Tolerance for comparing summed durations against the recording window.
const WINDOW_TOLERANCE_S: f64 = 1e-9;

/// Parameters of one protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Red actinic LED intensity, percent.
    pub actinic_led_intensity: u32,
    /// Green measuring LED intensity, percent.
    pub measurement_led_intensity: u32,
    /// Analog input sample rate.
    pub recording_hz: u32,
    /// Total recording window the green pulse must fit in, seconds.
    pub recording_length_s: f64,
    /// Duration of the actinic pulse.
    pub ared_duration_s: f64,
    /// Dark interval between the actinic pulse and the shutter opening.
    pub wait_after_ared_s: f64,
    /// Delay between the shutter opening and the green LED switching on.
    pub agreen_delay_s: f64,
    /// Duration of the green measuring pulse.
    pub agreen_duration_s: f64,
    /// Analog input span, volts.
    pub channel_range: f64,
    /// Output file name; always ends in `.csv`.
    pub filename: String,
    /// How early an action may fire ahead of its scheduled offset.
    pub action_epsilon_s: f64,
    /// Per-step additive timing corrections, keyed by step label.
    pub delay_overrides: BTreeMap<String, f64>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            actinic_led_intensity: 50,
            measurement_led_intensity: 50,
            recording_hz: 100_000,
            recording_length_s: 10.0,
            ared_duration_s: 1.0,
            wait_after_ared_s: 0.0,
            agreen_delay_s: 0.0,
            agreen_duration_s: 1.0,
            channel_range: 5.0,
            filename: "record.csv".to_string(),
            action_epsilon_s: 0.002,
            delay_overrides: BTreeMap::new(),
        }
    }
}

/// Sample counts derived from a config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleCounts {
    /// Sum of the four protocol intervals, seconds.
    pub protocol_duration_s: f64,
    /// Samples in the persisted waveform, starting at time zero.
    pub nominal: usize,
    /// Samples requested from the acquisition, including the pre-buffer.
    pub acquisition_budget: usize,
}

/// Append `.csv` unless already present.
pub fn ensure_csv_suffix(filename: &str) -> String {
    if filename.ends_with(".csv") {
        filename.to_string()
    } else {
        format!("{}.csv", filename)
    }
}

/// True if `name` is a single path component: no separators, no `.` or
/// `..`, so joining it onto a directory stays inside that directory.
pub fn is_bare_file_name(name: &str) -> bool {
    !name.contains(['/', '\\'])
        && Path::new(name).file_name() == Some(OsStr::new(name))
}

fn clamp_duration(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, max)
    }
}

impl ExperimentConfig {
    /// Coerce every field into its valid range.
    ///
    /// Intensities are capped at 100, the sample rate is clamped to the
    /// supported band, durations to 0-10 s, and the filename gets a `.csv`
    /// suffix. Non-finite override deltas are dropped.
    pub fn clamped(mut self) -> Self {
        self.actinic_led_intensity = self.actinic_led_intensity.min(100);
        self.measurement_led_intensity = self.measurement_led_intensity.min(100);
        self.recording_hz = self.recording_hz.clamp(MIN_RECORDING_HZ, MAX_RECORDING_HZ);
        self.recording_length_s = if self.recording_length_s.is_nan() {
            1.0
        } else {
            self.recording_length_s.clamp(1.0, MAX_RECORDING_LENGTH_S)
        };
        self.ared_duration_s = clamp_duration(self.ared_duration_s, MAX_STEP_DURATION_S);
        self.wait_after_ared_s = clamp_duration(self.wait_after_ared_s, MAX_STEP_DURATION_S);
        self.agreen_delay_s = clamp_duration(self.agreen_delay_s, MAX_STEP_DURATION_S);
        self.agreen_duration_s = clamp_duration(self.agreen_duration_s, MAX_STEP_DURATION_S);
        self.action_epsilon_s = clamp_duration(self.action_epsilon_s, MAX_ACTION_EPSILON_S);
        self.filename = ensure_csv_suffix(&self.filename);
        self.delay_overrides.retain(|_, delta| delta.is_finite());
        self
    }

    /// Check every field and the recording-window invariant.
    pub fn validate(&self) -> ProtocolResult<()> {
        for (name, intensity) in [
            ("actinic_led_intensity", self.actinic_led_intensity),
            ("measurement_led_intensity", self.measurement_led_intensity),
        ] {
            if intensity > 100 {
                return Err(config_error(format!(
                    "{} {} is outside 0-100",
                    name, intensity
                )));
            }
        }

        if !(MIN_RECORDING_HZ..=MAX_RECORDING_HZ).contains(&self.recording_hz) {
            return Err(config_error(format!(
                "recording_hz {} is outside {}-{}",
                self.recording_hz, MIN_RECORDING_HZ, MAX_RECORDING_HZ
            )));
        }

        if !(self.recording_length_s > 0.0 && self.recording_length_s <= MAX_RECORDING_LENGTH_S) {
            return Err(config_error(format!(
                "recording_length_s {} must be in (0, {}]",
                self.recording_length_s, MAX_RECORDING_LENGTH_S
            )));
        }

        for (name, value) in [
            ("ared_duration_s", self.ared_duration_s),
            ("wait_after_ared_s", self.wait_after_ared_s),
            ("agreen_delay_s", self.agreen_delay_s),
            ("agreen_duration_s", self.agreen_duration_s),
        ] {
            if !(0.0..=MAX_STEP_DURATION_S).contains(&value) {
                return Err(config_error(format!(
                    "{} {} is outside 0-{} s",
                    name, value, MAX_STEP_DURATION_S
                )));
            }
        }

        if !(self.channel_range.is_finite() && self.channel_range > 0.0) {
            return Err(config_error(format!(
                "channel_range {} must be a positive voltage",
                self.channel_range
            )));
        }

        if !(0.0..=MAX_ACTION_EPSILON_S).contains(&self.action_epsilon_s) {
            return Err(config_error(format!(
                "action_epsilon_s {} is outside 0-{} s",
                self.action_epsilon_s, MAX_ACTION_EPSILON_S
            )));
        }

        if self.filename.trim_end_matches(".csv").is_empty() || !self.filename.ends_with(".csv") {
            return Err(config_error(format!(
                "filename '{}' must be a non-empty name ending in .csv",
                self.filename
            )));
        }

        if !is_bare_file_name(&self.filename) {
            return Err(config_error(format!(
                "filename '{}' must be a bare file name without directories",
                self.filename
            )));
        }

        for (label, delta) in &self.delay_overrides {
            let step = label.parse::<Step>().map_err(config_error)?;
            if step == Step::AredOn {
                return Err(config_error(
                    "ared_on defines time zero and cannot be overridden".to_string(),
                ));
            }
            if !delta.is_finite() {
                return Err(config_error(format!(
                    "delay override for {} is not a finite number",
                    label
                )));
            }
        }

        self.sample_counts().map(|_| ())
    }

    /// Sum of the four protocol intervals.
    pub fn protocol_duration_s(&self) -> f64 {
        self.ared_duration_s + self.wait_after_ared_s + self.agreen_delay_s + self.agreen_duration_s
    }

    /// Derive the persisted and requested sample counts.
    ///
    /// Fails if the green pulse (delay plus duration) does not fit inside
    /// the recording window.
    pub fn sample_counts(&self) -> ProtocolResult<SampleCounts> {
        if self.agreen_delay_s + self.agreen_duration_s
            > self.recording_length_s + WINDOW_TOLERANCE_S
        {
            return Err(config_error(
                "The Agreen LED duration plus delay exceeds the recording length".to_string(),
            ));
        }

        let hz = f64::from(self.recording_hz);
        let protocol_duration_s = self.protocol_duration_s();
        let nominal = ((protocol_duration_s * hz).round() as usize).max(1);
        let acquisition_budget = (((PRE_BUFFER_S + protocol_duration_s) * hz) as usize).max(1);

        Ok(SampleCounts {
            protocol_duration_s,
            nominal,
            acquisition_budget,
        })
    }
}

fn config_error(message: String) -> ProtocolError {
    ProtocolError::Configuration(message)
}
