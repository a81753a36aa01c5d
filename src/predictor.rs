//! Fermentation completion estimation.
//!
//! A pure function over processed gravity history; it never sits on the
//! ingest or control path, and a caller treats `None` as "no estimate yet",
//! never as an error.

use chrono::{DateTime, Duration, Utc};

use crate::pipeline::rate::RateEstimator;

/// Minimum history length before estimating.
const MIN_SAMPLES: usize = 6;

/// Minimum history span before estimating.
const MIN_SPAN: Duration = Duration::hours(6);

/// Gravity must be falling at least this fast, SG per hour.
const MIN_FALL_RATE: f64 = 1e-5;

/// Estimates beyond this horizon are unreliable noise.
const MAX_HORIZON: Duration = Duration::days(60);

/// Samples fed into the trailing slope.
const SLOPE_WINDOW: usize = 24;

/// Estimate when gravity will reach `target_gravity`.
///
/// `history` is `(timestamp, filtered gravity)` oldest first. Returns
/// `None` when the history is too short, gravity is not falling, or the
/// extrapolation lands past a sanity horizon. A history already at or
/// below the target returns the last sample's timestamp.
pub fn estimate_completion(
    history: &[(DateTime<Utc>, f64)],
    target_gravity: f64,
) -> Option<DateTime<Utc>> {
    if history.len() < MIN_SAMPLES {
        return None;
    }
    let (first_at, _) = history.first()?;
    let (last_at, current) = history.last()?;
    if *last_at - *first_at < MIN_SPAN {
        return None;
    }
    if *current <= target_gravity {
        return Some(*last_at);
    }

    let mut estimator = RateEstimator::new(SLOPE_WINDOW);
    for (at, gravity) in history.iter().rev().take(SLOPE_WINDOW).rev() {
        estimator.push(*at, *gravity);
    }
    let slope = estimator.slope_per_hour();
    if slope >= -MIN_FALL_RATE {
        return None;
    }

    let hours = (current - target_gravity) / -slope;
    let horizon = Duration::milliseconds((hours * 3_600_000.0) as i64);
    if horizon > MAX_HORIZON {
        return None;
    }
    Some(*last_at + horizon)
}

/// Fallback target when a batch has no expected final gravity: 75 %
/// apparent attenuation from the measured OG.
pub fn default_target_gravity(measured_og: f64) -> f64 {
    1.0 + 0.25 * (measured_og - 1.0)
}
