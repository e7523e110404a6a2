//! Hardware capability surface.
//!
//! A fluorescence-induction rig needs three things from its instrument:
//! digital outputs driving the shutter, two analog outputs driving the LEDs,
//! and a hardware-timed analog input recording the photodiode. [`HardwarePort`]
//! exposes exactly those as blocking calls. Implementations own the device
//! handle; the protocol engine borrows the port mutably for the length of a
//! run, so a port is `Send` but never shared between threads.
//!
//! The channel and pin assignments below match the wiring of the
//! instrument front panel.

use serde::{Deserialize, Serialize};

use crate::error::HardwareResult;

/// Fixed channel and pin assignments.
pub mod pins {
    /// Digital pin gating the shutter driver.
    pub const GATE: u32 = 2;
    /// Digital pin triggering the shutter driver.
    pub const TRIGGER: u32 = 3;
    /// Analog output driving the red actinic LED ("Ared").
    pub const LED_RED: u32 = 0;
    /// Analog output driving the green measurement LED ("Agreen").
    pub const LED_GREEN: u32 = 1;
    /// Analog input carrying the photodiode signal.
    pub const ANALOG_IN: u32 = 0;
}

/// Acquisition state reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Idle, nothing configured.
    Ready,
    /// Applying configuration.
    Config,
    /// Filling the pre-trigger buffer.
    Prefill,
    /// Armed, waiting for the trigger.
    Armed,
    /// Waiting between acquisitions.
    Wait,
    /// Trigger seen, data about to flow.
    Triggered,
    /// Streaming samples.
    Running,
    /// Acquisition finished.
    Done,
}

impl DeviceState {
    /// Map a raw device status code to a state.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeviceState::Ready),
            1 => Some(DeviceState::Config),
            2 => Some(DeviceState::Prefill),
            3 => Some(DeviceState::Armed),
            4 => Some(DeviceState::Wait),
            5 => Some(DeviceState::Triggered),
            6 => Some(DeviceState::Running),
            7 => Some(DeviceState::Done),
            _ => None,
        }
    }

    /// True while the device is still preparing and no samples can flow yet.
    pub fn is_pre_acquisition(self) -> bool {
        matches!(
            self,
            DeviceState::Config | DeviceState::Prefill | DeviceState::Armed
        )
    }
}

/// One status snapshot of the analog input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStatus {
    /// Device acquisition state.
    pub state: DeviceState,
    /// Samples ready to be read.
    pub available: usize,
    /// Samples dropped by the device since the previous poll.
    pub lost: usize,
    /// Samples the device flagged as corrupted since the previous poll.
    pub corrupted: usize,
}

impl AcquisitionStatus {
    /// A status with no samples and no faults.
    pub fn idle(state: DeviceState) -> Self {
        Self {
            state,
            available: 0,
            lost: 0,
            corrupted: 0,
        }
    }
}

/// Blocking instrument operations used by the protocol engine.
pub trait HardwarePort: Send {
    /// Configure the analog input for a hardware-timed acquisition.
    fn configure_input(&mut self, channel: u32, range_v: f64, sample_rate_hz: f64)
        -> HardwareResult<()>;

    /// Start the configured acquisition.
    fn start_acquisition(&mut self) -> HardwareResult<()>;

    /// Stop the acquisition. Must be safe to call when already stopped.
    fn stop_acquisition(&mut self) -> HardwareResult<()>;

    /// Report device state and sample counters.
    fn poll_status(&mut self) -> HardwareResult<AcquisitionStatus>;

    /// Read exactly `count` samples (volts) from `channel`.
    ///
    /// Callers only request what the preceding [`poll_status`](Self::poll_status)
    /// reported as available.
    fn read_samples(&mut self, channel: u32, count: usize) -> HardwareResult<Vec<f64>>;

    /// Drive an LED analog output to `volts`.
    fn set_led_voltage(&mut self, channel: u32, volts: f64) -> HardwareResult<()>;

    /// Drive a digital output pin.
    fn set_digital_pin(&mut self, pin: u32, high: bool) -> HardwareResult<()>;

    /// Open or close the shutter.
    ///
    /// Opening raises the gate then releases the trigger; closing raises the
    /// trigger then drops the gate. The order matters to the shutter driver.
    fn set_shutter(&mut self, open: bool) -> HardwareResult<()> {
        if open {
            self.set_digital_pin(pins::GATE, true)?;
            self.set_digital_pin(pins::TRIGGER, false)
        } else {
            self.set_digital_pin(pins::TRIGGER, true)?;
            self.set_digital_pin(pins::GATE, false)
        }
    }

    /// Drive both LEDs to 0 V.
    ///
    /// Both channels are attempted even if the first fails; the first error
    /// is returned.
    fn all_leds_off(&mut self) -> HardwareResult<()> {
        let red = self.set_led_voltage(pins::LED_RED, 0.0);
        let green = self.set_led_voltage(pins::LED_GREEN, 0.0);
        red.and(green)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HardwareError, HardwareErrorKind};

    #[derive(Default)]
    struct PinRecorder {
        pins: Vec<(u32, bool)>,
        leds: Vec<(u32, f64)>,
        fail_red: bool,
    }

    impl HardwarePort for PinRecorder {
        fn configure_input(&mut self, _: u32, _: f64, _: f64) -> HardwareResult<()> {
            Ok(())
        }
        fn start_acquisition(&mut self) -> HardwareResult<()> {
            Ok(())
        }
        fn stop_acquisition(&mut self) -> HardwareResult<()> {
            Ok(())
        }
        fn poll_status(&mut self) -> HardwareResult<AcquisitionStatus> {
            Ok(AcquisitionStatus::idle(DeviceState::Ready))
        }
        fn read_samples(&mut self, _: u32, count: usize) -> HardwareResult<Vec<f64>> {
            Ok(vec![0.0; count])
        }
        fn set_led_voltage(&mut self, channel: u32, volts: f64) -> HardwareResult<()> {
            if self.fail_red && channel == pins::LED_RED {
                return Err(HardwareError::new(
                    HardwareErrorKind::Hardware,
                    "set_led_voltage",
                    "stuck",
                ));
            }
            self.leds.push((channel, volts));
            Ok(())
        }
        fn set_digital_pin(&mut self, pin: u32, high: bool) -> HardwareResult<()> {
            self.pins.push((pin, high));
            Ok(())
        }
    }

    #[test]
    fn test_shutter_pin_sequence() {
        let mut port = PinRecorder::default();

        port.set_shutter(true).unwrap();
        assert_eq!(port.pins, vec![(pins::GATE, true), (pins::TRIGGER, false)]);

        port.pins.clear();
        port.set_shutter(false).unwrap();
        assert_eq!(port.pins, vec![(pins::TRIGGER, true), (pins::GATE, false)]);
    }

    #[test]
    fn test_all_leds_off_attempts_both_channels() {
        let mut port = PinRecorder {
            fail_red: true,
            ..Default::default()
        };

        let result = port.all_leds_off();
        assert!(result.is_err());
        assert_eq!(port.leds, vec![(pins::LED_GREEN, 0.0)]);
    }

    #[test]
    fn test_device_state_codes() {
        assert_eq!(DeviceState::from_code(2), Some(DeviceState::Prefill));
        assert_eq!(DeviceState::from_code(6), Some(DeviceState::Running));
        assert_eq!(DeviceState::from_code(9), None);

        assert!(DeviceState::Armed.is_pre_acquisition());
        assert!(!DeviceState::Triggered.is_pre_acquisition());
        assert!(!DeviceState::Running.is_pre_acquisition());
    }
}
