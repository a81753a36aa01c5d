//! Control decision strategies.
//!
//! The default is dual-mode hysteresis. A model-predictive strategy can be
//! swapped in per installation; mutex and dwell enforcement live in the
//! controller loop, so those guarantees hold regardless of the decision
//! source.

use crate::store::Reading;

/// What a strategy wants an actuator to do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desire {
    /// Command the actuator on.
    On,
    /// Command the actuator off.
    Off,
    /// Leave the actuator as it is.
    Unchanged,
}

/// A per-tick decision source for one batch.
pub trait ControlStrategy: Send + Sync {
    /// Decide desired `(heater, cooler)` states.
    ///
    /// `history` is the batch's recent processed readings (oldest first),
    /// `temp_c` the latest filtered temperature, `ambient` the most recent
    /// ambient sample if one is configured.
    fn decide(
        &self,
        history: &[Reading],
        temp_c: f64,
        target: f64,
        hysteresis: f64,
        ambient: Option<f64>,
    ) -> (Desire, Desire);
}

/// Dual-mode hysteresis: act outside `[target − h, target + h]`, hold
/// inside it.
///
/// Comparisons are strict, so a temperature exactly on a band edge causes
/// no transition.
pub struct HysteresisStrategy;

impl ControlStrategy for HysteresisStrategy {
    fn decide(
        &self,
        _history: &[Reading],
        temp_c: f64,
        target: f64,
        hysteresis: f64,
        _ambient: Option<f64>,
    ) -> (Desire, Desire) {
        let low = target - hysteresis;
        let high = target + hysteresis;

        let heater = if temp_c < low {
            Desire::On
        } else if temp_c > high {
            Desire::Off
        } else {
            Desire::Unchanged
        };

        let cooler = if temp_c > high {
            Desire::On
        } else if temp_c < low {
            Desire::Off
        } else {
            Desire::Unchanged
        };

        (heater, cooler)
    }
}
