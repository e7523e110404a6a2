//! Error injection for the simulated instrument.
//!
//! Lets tests make individual [`HardwarePort`](fluor_core::HardwarePort)
//! operations fail on a schedule, at random, or permanently after a link
//! loss, so the protocol engine's cleanup paths can be exercised.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fluor_core::{HardwareError, HardwareErrorKind};
use parking_lot::Mutex;

use crate::rng::MockRng;

/// Port operation that can be targeted by an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortOp {
    /// `configure_input`
    ConfigureInput,
    /// `start_acquisition`
    StartAcquisition,
    /// `stop_acquisition`
    StopAcquisition,
    /// `poll_status`
    PollStatus,
    /// `read_samples`
    ReadSamples,
    /// `set_led_voltage`
    SetLedVoltage,
    /// `set_digital_pin`
    SetDigitalPin,
}

impl PortOp {
    /// Name of the trait method.
    pub fn as_str(self) -> &'static str {
        match self {
            PortOp::ConfigureInput => "configure_input",
            PortOp::StartAcquisition => "start_acquisition",
            PortOp::StopAcquisition => "stop_acquisition",
            PortOp::PollStatus => "poll_status",
            PortOp::ReadSamples => "read_samples",
            PortOp::SetLedVoltage => "set_led_voltage",
            PortOp::SetDigitalPin => "set_digital_pin",
        }
    }
}

impl fmt::Display for PortOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Let `count` calls of `operation` succeed, fail every call after.
    FailAfterN {
        /// Targeted operation.
        operation: PortOp,
        /// Successful calls before failures start.
        count: u32,
    },
    /// Every call of `operation` times out.
    Timeout {
        /// Targeted operation.
        operation: PortOp,
    },
    /// The first call of `operation` loses the link; every later call of any
    /// operation fails with a communication error.
    CommunicationLoss {
        /// Operation on which the link drops.
        operation: PortOp,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    calls: HashMap<PortOp, u32>,
    link_lost: bool,
}

/// Failure configuration shared by clones of a mock port's handle.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    failure_rate: f64,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// No injected failures.
    pub fn none() -> Self {
        Self::scenarios(Vec::new())
    }

    /// A single scripted scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scripted scenarios, evaluated in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            failure_rate: 0.0,
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(None)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Every operation fails with probability `rate`, reproducibly for a seed.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self {
            failure_rate: rate.clamp(0.0, 1.0),
            rng: Arc::new(MockRng::new(seed)),
            ..Self::none()
        }
    }

    /// Record a call of `operation` and decide whether it fails.
    pub fn check(&self, operation: PortOp) -> Result<(), HardwareError> {
        let mut state = self.state.lock();

        if state.link_lost {
            return Err(HardwareError::new(
                HardwareErrorKind::Communication,
                operation.as_str(),
                "Communication lost",
            ));
        }

        let calls = {
            let entry = state.calls.entry(operation).or_insert(0);
            *entry += 1;
            *entry
        };

        for scenario in self.scenarios.iter() {
            match *scenario {
                ErrorScenario::FailAfterN { operation: op, count } if op == operation => {
                    if calls > count {
                        return Err(HardwareError::new(
                            HardwareErrorKind::Hardware,
                            operation.as_str(),
                            format!("Injected failure after {} calls", count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if op == operation => {
                    return Err(HardwareError::timeout(
                        operation.as_str(),
                        "Injected timeout",
                    ));
                }
                ErrorScenario::CommunicationLoss { operation: op } if op == operation => {
                    state.link_lost = true;
                    return Err(HardwareError::new(
                        HardwareErrorKind::Communication,
                        operation.as_str(),
                        "Communication lost",
                    ));
                }
                _ => {}
            }
        }

        if self.rng.should_fail(self.failure_rate) {
            return Err(HardwareError::new(
                HardwareErrorKind::Hardware,
                operation.as_str(),
                "Random injected failure",
            ));
        }

        Ok(())
    }

    /// Number of times `operation` has been checked.
    pub fn calls(&self, operation: PortOp) -> u32 {
        self.state.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Clear counters and restore the link.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
