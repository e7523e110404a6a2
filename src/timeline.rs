//! Protocol timeline.
//!
//! Maps every protocol [`Step`] to its offset in seconds from time zero, the
//! moment the red actinic LED switches on. Offsets accumulate step by step
//! from the experiment's interval durations, optionally nudged by per-step
//! delay corrections, and never decrease.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::experiment::{ExperimentConfig, END_RECORDING_OFFSET_S};

/// Protocol steps in temporal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Red actinic LED on. Defines time zero.
    AredOn,
    /// Red actinic LED off.
    AredOff,
    /// Dark interval after the actinic pulse.
    WaitAfterAred,
    /// Shutter opens.
    ShutterOpened,
    /// Green measuring LED on.
    AgreenOn,
    /// Green measuring LED off.
    AgreenOff,
    /// Acquisition stops.
    EndRecording,
}

impl Step {
    /// Every step, in temporal order.
    pub const ALL: [Step; 7] = [
        Step::AredOn,
        Step::AredOff,
        Step::WaitAfterAred,
        Step::ShutterOpened,
        Step::AgreenOn,
        Step::AgreenOff,
        Step::EndRecording,
    ];

    /// Event label of the step.
    pub fn label(self) -> &'static str {
        match self {
            Step::AredOn => "ared_on",
            Step::AredOff => "ared_off",
            Step::WaitAfterAred => "wait_after_ared",
            Step::ShutterOpened => "shutter_opened",
            Step::AgreenOn => "agreen_on",
            Step::AgreenOff => "agreen_off",
            Step::EndRecording => "end_recording",
        }
    }

    /// Time this step adds after the previous one.
    fn contribution(self, config: &ExperimentConfig) -> f64 {
        match self {
            Step::AredOn | Step::WaitAfterAred => 0.0,
            Step::AredOff => config.ared_duration_s,
            Step::ShutterOpened => config.wait_after_ared_s,
            Step::AgreenOn => config.agreen_delay_s,
            Step::AgreenOff => config.agreen_duration_s,
            Step::EndRecording => END_RECORDING_OFFSET_S,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.label() == s)
            .ok_or_else(|| format!("unknown protocol step '{}'", s))
    }
}

/// Offsets of every step from time zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    offsets: BTreeMap<Step, f64>,
}

impl Timeline {
    /// Build the timeline from a config and its own `delay_overrides`.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::build(config, &config.delay_overrides)
    }

    /// Build the timeline from a config and explicit per-step corrections.
    ///
    /// Each override delta is added to its step's offset and carried into
    /// every later step. Labels that do not name a step are ignored, and an
    /// override for `ared_on` is ignored since that step is time zero.
    pub fn build(config: &ExperimentConfig, overrides: &BTreeMap<String, f64>) -> Self {
        let mut deltas = BTreeMap::new();
        for (label, delta) in overrides {
            match label.parse::<Step>() {
                Ok(Step::AredOn) => {
                    warn!(delta, "Ignoring delay override for ared_on; it is time zero")
                }
                Ok(step) if delta.is_finite() => {
                    deltas.insert(step, *delta);
                }
                Ok(step) => warn!(step = %step, delta, "Ignoring non-finite delay override"),
                Err(e) => warn!(error = %e, "Ignoring delay override"),
            }
        }

        let mut offsets = BTreeMap::new();
        let mut offset = 0.0_f64;
        for step in Step::ALL {
            if step != Step::AredOn {
                let next = offset
                    + step.contribution(config)
                    + deltas.get(&step).copied().unwrap_or(0.0);
                offset = next.max(offset);
            }
            offsets.insert(step, offset);
        }

        Self { offsets }
    }

    /// Offset of `step` from time zero, in seconds.
    pub fn offset(&self, step: Step) -> f64 {
        self.offsets.get(&step).copied().unwrap_or(0.0)
    }

    /// Steps and offsets in temporal order.
    pub fn iter(&self) -> impl Iterator<Item = (Step, f64)> + '_ {
        self.offsets.iter().map(|(step, offset)| (*step, *offset))
    }

    /// Offset of the final step.
    pub fn total_s(&self) -> f64 {
        self.offset(Step::EndRecording)
    }
}

impl fmt::Display for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (step, offset)) in self.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:>16}  +{:.4} s", step.label(), offset)?;
        }
        Ok(())
    }
}
