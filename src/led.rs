//! LED drive levels.
//!
//! Operators specify LED brightness as an integer percentage. Each LED
//! driver has its own usable voltage window: the red actinic LED conducts
//! from 0 V, the green measuring LED only above 1 V. An intensity of 0 always
//! means fully off (0 V), not the bottom of the window.

use std::fmt;

use fluor_core::hardware::pins;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Analog output voltage window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRange {
    /// Voltage at 1 % intensity and above.
    pub min: f64,
    /// Voltage at 100 % intensity.
    pub max: f64,
}

impl VoltageRange {
    /// Create a voltage range.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Check whether `voltage` lies inside the window.
    pub fn contains(&self, voltage: f64) -> bool {
        voltage >= self.min && voltage <= self.max
    }
}

/// The two LEDs of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Led {
    /// Red actinic LED ("Ared").
    Red,
    /// Green measuring LED ("Agreen").
    Green,
}

impl Led {
    /// Analog output channel wired to this LED.
    pub fn channel(self) -> u32 {
        match self {
            Led::Red => pins::LED_RED,
            Led::Green => pins::LED_GREEN,
        }
    }

    /// Usable drive window of this LED.
    pub fn voltage_range(self) -> VoltageRange {
        match self {
            Led::Red => VoltageRange::new(0.0, 5.0),
            Led::Green => VoltageRange::new(1.0, 5.0),
        }
    }
}

impl fmt::Display for Led {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Led::Red => f.write_str("red"),
            Led::Green => f.write_str("green"),
        }
    }
}

/// Map an intensity percentage (0-100) to a drive voltage.
///
/// ```
/// use fluor_daq::led::{intensity_to_voltage, Led};
///
/// assert_eq!(intensity_to_voltage(Led::Green, 0).unwrap(), 0.0);
/// assert_eq!(intensity_to_voltage(Led::Green, 50).unwrap(), 3.0);
/// assert!(intensity_to_voltage(Led::Red, 101).is_err());
/// ```
pub fn intensity_to_voltage(led: Led, intensity: u32) -> ProtocolResult<f64> {
    if intensity > 100 {
        return Err(ProtocolError::Configuration(format!(
            "{} LED intensity {} is outside 0-100",
            led, intensity
        )));
    }
    if intensity == 0 {
        return Ok(0.0);
    }
    let range = led.voltage_range();
    Ok(range.min + (range.max - range.min) * f64::from(intensity) / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_intensity_is_off() {
        assert_eq!(intensity_to_voltage(Led::Red, 0).unwrap(), 0.0);
        assert_eq!(intensity_to_voltage(Led::Green, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_linear_mapping_within_window() {
        assert_eq!(intensity_to_voltage(Led::Red, 100).unwrap(), 5.0);
        assert_eq!(intensity_to_voltage(Led::Red, 50).unwrap(), 2.5);
        assert_eq!(intensity_to_voltage(Led::Green, 100).unwrap(), 5.0);
        assert!((intensity_to_voltage(Led::Green, 1).unwrap() - 1.04).abs() < 1e-12);
    }

    #[test]
    fn test_mapped_voltage_stays_in_range() {
        for led in [Led::Red, Led::Green] {
            for intensity in 1..=100 {
                let v = intensity_to_voltage(led, intensity).unwrap();
                assert!(led.voltage_range().contains(v), "{} {}% -> {} V", led, intensity, v);
            }
        }
    }

    #[test]
    fn test_out_of_range_intensity_rejected() {
        let err = intensity_to_voltage(Led::Green, 150).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_channels() {
        assert_eq!(Led::Red.channel(), pins::LED_RED);
        assert_eq!(Led::Green.channel(), pins::LED_GREEN);
    }
}
