//! Scheduled protocol actions.
//!
//! A [`ScheduledAction`] pairs a protocol [`Step`] with the hardware
//! [`Operation`] it performs and the offset from time zero at which it is
//! due. The acquisition loop asks each action whether it is due on every
//! iteration; an action fires at most once per run.

use std::time::Duration;

use fluor_core::{Clock, EventLog, HardwarePort, HardwareResult};
use tracing::{debug, info};

use crate::error::{ProtocolError, ProtocolResult};
use crate::experiment::ExperimentConfig;
use crate::led::{intensity_to_voltage, Led};
use crate::stop::{StopReason, StopSignal};
use crate::timeline::{Step, Timeline};

/// Slack applied to the readiness comparison so that an elapsed time equal
/// to `offset - epsilon` counts as due despite float rounding.
const READINESS_TOLERANCE_S: f64 = 1e-9;

/// Longest uninterrupted sleep inside a [`Operation::Wait`]; the stop
/// signal is checked between slices.
pub const WAIT_SLICE: Duration = Duration::from_millis(10);

/// What an action does when it fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Drive an LED to a voltage.
    SetLed {
        /// Target LED.
        led: Led,
        /// Drive voltage.
        volts: f64,
    },
    /// Open or close the shutter.
    Shutter {
        /// Open when true.
        open: bool,
    },
    /// Block for a fixed time, or until the run is stopped.
    Wait(Duration),
    /// End the acquisition.
    StopRecording,
}

/// Resources an [`Operation`] may use.
pub struct ActionContext<'a> {
    /// Instrument.
    pub port: &'a mut dyn HardwarePort,
    /// Time source for waits.
    pub clock: &'a dyn Clock,
    /// Run stop flag.
    pub stop: &'a StopSignal,
}

impl Operation {
    /// Perform the operation.
    pub fn invoke(&self, ctx: &mut ActionContext<'_>) -> HardwareResult<()> {
        match self {
            Operation::SetLed { led, volts } => ctx.port.set_led_voltage(led.channel(), *volts),
            Operation::Shutter { open } => ctx.port.set_shutter(*open),
            Operation::Wait(duration) => {
                let deadline = ctx.clock.now() + duration.as_secs_f64();
                loop {
                    if ctx.stop.is_requested() {
                        debug!("Wait cut short by stop request");
                        break;
                    }
                    let remaining =
                        Duration::from_secs_f64((deadline - ctx.clock.now()).max(0.0));
                    if remaining.is_zero() {
                        break;
                    }
                    ctx.clock.sleep(remaining.min(WAIT_SLICE));
                }
                Ok(())
            }
            Operation::StopRecording => {
                ctx.stop.request(StopReason::ProtocolComplete);
                Ok(())
            }
        }
    }
}

/// One protocol step with its due time and execute-once state.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    step: Step,
    offset_s: f64,
    operation: Operation,
    epsilon_s: f64,
    executed: bool,
}

impl ScheduledAction {
    /// Create an action due `offset_s` after time zero, allowed to fire up to
    /// `epsilon_s` early.
    pub fn new(step: Step, offset_s: f64, operation: Operation, epsilon_s: f64) -> Self {
        Self {
            step,
            offset_s,
            operation,
            epsilon_s: epsilon_s.max(0.0),
            executed: false,
        }
    }

    /// Protocol step.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Event label.
    pub fn label(&self) -> &'static str {
        self.step.label()
    }

    /// Offset from time zero.
    pub fn offset_s(&self) -> f64 {
        self.offset_s
    }

    /// Operation performed when fired.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// True once the action has fired.
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// True if the action has not fired and `elapsed_s` has reached its
    /// offset minus the tolerance.
    pub fn should_execute(&self, elapsed_s: f64) -> bool {
        !self.executed && elapsed_s >= self.offset_s - self.epsilon_s - READINESS_TOLERANCE_S
    }

    /// Fire the action.
    ///
    /// Returns the clock time at which the operation completed, or `None` if
    /// the action had already fired. The action is marked as fired before
    /// the operation runs, so a failing operation is never retried.
    ///
    /// With `zero_time` known the event log gets a timing record comparing
    /// the scheduled offset with the actual one; otherwise a bare event.
    pub fn execute(
        &mut self,
        ctx: &mut ActionContext<'_>,
        log: &mut EventLog,
        zero_time: Option<f64>,
    ) -> ProtocolResult<Option<f64>> {
        if self.executed {
            return Ok(None);
        }
        self.executed = true;

        self.operation.invoke(ctx)?;
        let completed_at = ctx.clock.now();

        match zero_time {
            Some(t_zero) => {
                let actual_s = completed_at - t_zero;
                log.log_timing(self.label(), self.offset_s, actual_s)?;
                debug!(
                    step = %self.step,
                    scheduled_s = self.offset_s,
                    actual_s,
                    latency_ms = (actual_s - self.offset_s) * 1e3,
                    "Action executed"
                );
            }
            None => {
                log.log(self.label())?;
                debug!(step = %self.step, "Action executed");
            }
        }

        Ok(Some(completed_at))
    }
}

/// Build the seven protocol actions for a run.
pub fn build_actions(
    config: &ExperimentConfig,
    timeline: &Timeline,
) -> ProtocolResult<Vec<ScheduledAction>> {
    let red_v = intensity_to_voltage(Led::Red, config.actinic_led_intensity)?;
    let green_v = intensity_to_voltage(Led::Green, config.measurement_led_intensity)?;
    let wait = Duration::try_from_secs_f64(config.wait_after_ared_s.max(0.0)).map_err(|e| {
        ProtocolError::Configuration(format!("wait_after_ared_s is not a valid duration: {}", e))
    })?;

    let actions: Vec<ScheduledAction> = Step::ALL
        .into_iter()
        .map(|step| {
            let operation = match step {
                Step::AredOn => Operation::SetLed {
                    led: Led::Red,
                    volts: red_v,
                },
                Step::AredOff => Operation::SetLed {
                    led: Led::Red,
                    volts: 0.0,
                },
                Step::WaitAfterAred => Operation::Wait(wait),
                Step::ShutterOpened => Operation::Shutter { open: true },
                Step::AgreenOn => Operation::SetLed {
                    led: Led::Green,
                    volts: green_v,
                },
                Step::AgreenOff => Operation::SetLed {
                    led: Led::Green,
                    volts: 0.0,
                },
                Step::EndRecording => Operation::StopRecording,
            };
            ScheduledAction::new(
                step,
                timeline.offset(step),
                operation,
                config.action_epsilon_s,
            )
        })
        .collect();

    info!(
        red_v,
        green_v,
        total_s = timeline.total_s(),
        "Built {} protocol actions",
        actions.len()
    );
    Ok(actions)
}

/// Check that the list has exactly one `ared_on` action at offset 0.0.
///
/// Returns the index of that action, the zero anchor of the run.
pub fn validate_actions(actions: &[ScheduledAction]) -> ProtocolResult<usize> {
    let mut anchors = actions
        .iter()
        .enumerate()
        .filter(|(_, action)| action.step() == Step::AredOn);

    let (index, anchor) = anchors.next().ok_or_else(|| {
        ProtocolError::Configuration("action list has no ared_on zero anchor".to_string())
    })?;
    if anchors.next().is_some() {
        return Err(ProtocolError::Configuration(
            "action list has more than one ared_on action".to_string(),
        ));
    }
    if anchor.offset_s() != 0.0 {
        return Err(ProtocolError::Configuration(format!(
            "ared_on must be scheduled at offset 0.0, found {}",
            anchor.offset_s()
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluor_core::hardware::pins;
    use fluor_core::SimulatedClock;
    use fluor_driver_mock::{MockPort, PortCommand};
    use std::sync::Arc;

    fn fixture() -> (Arc<SimulatedClock>, MockPort, StopSignal, EventLog) {
        let clock = Arc::new(SimulatedClock::new());
        let port = MockPort::new(clock.clone());
        let mut log = EventLog::new(clock.clone());
        log.start("protocol_start");
        (clock, port, StopSignal::new(), log)
    }

    #[test]
    fn test_epsilon_boundary() {
        let action = ScheduledAction::new(Step::AgreenOn, 1.0, Operation::StopRecording, 0.002);

        assert!(!action.should_execute(0.9979));
        assert!(action.should_execute(1.0 - 0.002));
        assert!(action.should_execute(1.5));
    }

    #[test]
    fn test_zero_epsilon_fires_at_offset() {
        let action = ScheduledAction::new(Step::AredOff, 0.5, Operation::StopRecording, 0.0);
        assert!(!action.should_execute(0.4999));
        assert!(action.should_execute(0.5));
    }

    #[test]
    fn test_execute_once() {
        let (clock, mut port, stop, mut log) = fixture();
        let mut action = ScheduledAction::new(
            Step::AredOn,
            0.0,
            Operation::SetLed {
                led: Led::Red,
                volts: 2.5,
            },
            0.002,
        );

        let mut ctx = ActionContext {
            port: &mut port,
            clock: clock.as_ref(),
            stop: &stop,
        };
        let first = action.execute(&mut ctx, &mut log, None).unwrap();
        let second = action.execute(&mut ctx, &mut log, None).unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(action.is_executed());
        assert!(!action.should_execute(100.0));

        let led_writes = port
            .commands()
            .iter()
            .filter(|(_, cmd)| matches!(cmd, PortCommand::SetLedVoltage { .. }))
            .count();
        assert_eq!(led_writes, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_failed_operation_is_not_retried() {
        let (clock, mut port, stop, mut log) = fixture();
        let mut action = ScheduledAction::new(
            Step::AgreenOn,
            0.0,
            Operation::SetLed {
                led: Led::Green,
                volts: 9.0,
            },
            0.0,
        );
        let mut ctx = ActionContext {
            port: &mut port,
            clock: clock.as_ref(),
            stop: &stop,
        };

        assert!(action.execute(&mut ctx, &mut log, None).is_err());
        assert!(action.is_executed());
        assert_eq!(action.execute(&mut ctx, &mut log, None).unwrap(), None);
    }

    #[test]
    fn test_timing_record_with_zero_time() {
        let (clock, mut port, stop, mut log) = fixture();
        clock.sleep(Duration::from_millis(1003));
        let mut action = ScheduledAction::new(
            Step::AredOff,
            1.0,
            Operation::SetLed {
                led: Led::Red,
                volts: 0.0,
            },
            0.002,
        );
        let mut ctx = ActionContext {
            port: &mut port,
            clock: clock.as_ref(),
            stop: &stop,
        };

        action.execute(&mut ctx, &mut log, Some(0.0)).unwrap();
        let timing = log.events()[1].timing.unwrap();
        assert_eq!(timing.scheduled_s, 1.0);
        assert!((timing.latency_s - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_operations_drive_hardware() {
        let (clock, mut port, stop, _) = fixture();
        let mut ctx = ActionContext {
            port: &mut port,
            clock: clock.as_ref(),
            stop: &stop,
        };

        Operation::Shutter { open: true }.invoke(&mut ctx).unwrap();
        Operation::Wait(Duration::from_millis(250)).invoke(&mut ctx).unwrap();
        Operation::StopRecording.invoke(&mut ctx).unwrap();

        assert!(port.shutter_open());
        assert!((clock.elapsed().as_secs_f64() - 0.25).abs() < 1e-6);
        assert_eq!(stop.reason(), Some(StopReason::ProtocolComplete));
    }

    #[test]
    fn test_wait_ends_when_stop_requested() {
        let (clock, mut port, stop, _) = fixture();
        stop.cancel();
        let mut ctx = ActionContext {
            port: &mut port,
            clock: clock.as_ref(),
            stop: &stop,
        };

        Operation::Wait(Duration::from_secs(10)).invoke(&mut ctx).unwrap();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_build_actions_wiring() {
        let config = ExperimentConfig {
            actinic_led_intensity: 100,
            measurement_led_intensity: 50,
            wait_after_ared_s: 0.3,
            ..Default::default()
        };
        let timeline = Timeline::from_config(&config);
        let actions = build_actions(&config, &timeline).unwrap();

        assert_eq!(actions.len(), 7);
        assert_eq!(validate_actions(&actions).unwrap(), 0);
        assert_eq!(
            actions[0].operation(),
            &Operation::SetLed {
                led: Led::Red,
                volts: 5.0
            }
        );
        match actions[2].operation() {
            Operation::Wait(wait) => assert!((wait.as_secs_f64() - 0.3).abs() < 1e-9),
            other => panic!("expected a wait, got {:?}", other),
        }
        assert_eq!(
            actions[4].operation(),
            &Operation::SetLed {
                led: Led::Green,
                volts: 3.0
            }
        );
        assert_eq!(actions[6].operation(), &Operation::StopRecording);
        for action in &actions {
            assert_eq!(action.offset_s(), timeline.offset(action.step()));
        }
        assert_eq!(Led::Green.channel(), pins::LED_GREEN);
    }

    #[test]
    fn test_validate_actions_rejects_bad_anchor() {
        let stop = || Operation::StopRecording;

        let missing = vec![ScheduledAction::new(Step::AredOff, 1.0, stop(), 0.0)];
        assert!(validate_actions(&missing).is_err());

        let duplicated = vec![
            ScheduledAction::new(Step::AredOn, 0.0, stop(), 0.0),
            ScheduledAction::new(Step::AredOn, 0.0, stop(), 0.0),
        ];
        assert!(validate_actions(&duplicated).is_err());

        let shifted = vec![ScheduledAction::new(Step::AredOn, 0.1, stop(), 0.0)];
        assert!(validate_actions(&shifted).is_err());
    }
}
