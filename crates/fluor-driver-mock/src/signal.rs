//! Photodiode signal model.
//!
//! With the shutter open and the green measuring light on, chlorophyll
//! fluorescence rises from its minimal level `F0` towards `Fm` roughly
//! exponentially (the fast phase of the Kautsky induction curve). The red
//! actinic light adds a small constant leak onto the detector. With the
//! shutter closed only the detector's dark level remains.

use serde::{Deserialize, Serialize};

/// Full-scale LED drive voltage used to normalise intensities.
const FULL_SCALE_V: f64 = 5.0;

/// Parameters of the simulated fluorescence response, in volts and seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InductionModel {
    /// Detector output with no light.
    pub dark_v: f64,
    /// Fluorescence at the onset of measuring light (full-scale drive).
    pub f0_v: f64,
    /// Saturated fluorescence (full-scale drive).
    pub fm_v: f64,
    /// Rise time constant.
    pub tau_s: f64,
    /// Actinic light leaking onto the detector at full-scale drive.
    pub actinic_leak_v: f64,
}

impl Default for InductionModel {
    fn default() -> Self {
        Self {
            dark_v: 0.02,
            f0_v: 0.4,
            fm_v: 1.6,
            tau_s: 0.08,
            actinic_leak_v: 0.05,
        }
    }
}

impl InductionModel {
    /// Detector voltage for the given illumination.
    ///
    /// `green_on_for_s` is how long the measuring light has been on, or
    /// `None` when it is off.
    pub fn level(
        &self,
        shutter_open: bool,
        red_v: f64,
        green_v: f64,
        green_on_for_s: Option<f64>,
    ) -> f64 {
        if !shutter_open {
            return self.dark_v;
        }

        let mut level = self.dark_v + self.actinic_leak_v * (red_v / FULL_SCALE_V);
        if let Some(t) = green_on_for_s {
            let drive = (green_v / FULL_SCALE_V).clamp(0.0, 1.0);
            let rise = 1.0 - (-t.max(0.0) / self.tau_s).exp();
            level += drive * (self.f0_v + (self.fm_v - self.f0_v) * rise);
        }
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_shutter_is_dark() {
        let model = InductionModel::default();
        assert_eq!(model.level(false, 5.0, 5.0, Some(1.0)), model.dark_v);
    }

    #[test]
    fn test_induction_rises_towards_fm() {
        let model = InductionModel::default();
        let onset = model.level(true, 0.0, 5.0, Some(0.0));
        let early = model.level(true, 0.0, 5.0, Some(model.tau_s));
        let late = model.level(true, 0.0, 5.0, Some(10.0 * model.tau_s));

        assert!((onset - (model.dark_v + model.f0_v)).abs() < 1e-12);
        assert!(early > onset && late > early);
        assert!((late - (model.dark_v + model.fm_v)).abs() < 1e-3);
    }

    #[test]
    fn test_actinic_leak_scales_with_drive() {
        let model = InductionModel::default();
        let half = model.level(true, 2.5, 0.0, None) - model.dark_v;
        assert!((half - model.actinic_leak_v / 2.0).abs() < 1e-12);
    }
}
