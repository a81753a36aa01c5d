//! Per-device signal processing.
//!
//! Each device owns a [`DeviceProcessingState`]: two scalar Kalman filters
//! (gravity and temperature), a residual window for outlier detection, and
//! a trailing window for rate estimation. States are created lazily,
//! warm-started from the most recent valid persisted reading, and discarded
//! on explicit reset.

pub mod anomaly;
pub mod kalman;
pub mod rate;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::pipeline::anomaly::ResidualWindow;
use crate::pipeline::kalman::ScalarKalman;
use crate::pipeline::rate::RateEstimator;
use crate::store::Database;

/// Process noise for the gravity track, SG² per hour.
pub const Q_GRAVITY: f64 = 1e-8;

/// Process noise for the temperature track, °C² per hour.
pub const Q_TEMPERATURE: f64 = 1e-2;

/// Measurement variance for gravity, SG².
pub const R_GRAVITY: f64 = 1e-6;

/// Measurement variance for temperature, °C².
pub const R_TEMPERATURE: f64 = 1e-1;

/// Initial estimate variance, shared by cold and warm starts.
pub const P0: f64 = 1.0;

/// Residual window length per quantity.
pub const ANOMALY_WINDOW: usize = 20;

/// Rate-estimation window length per quantity.
pub const RATE_WINDOW: usize = 10;

/// Robust z-score above which a channel is an outlier.
pub const Z_LIMIT: f64 = 3.5;

/// Hard gravity residual limit, SG.
pub const GRAVITY_RESIDUAL_LIMIT: f64 = 0.003;

/// Hard temperature residual limit, °C.
pub const TEMPERATURE_RESIDUAL_LIMIT: f64 = 2.0;

/// Gravity should not rise meaningfully during fermentation, SG per hour.
pub const GRAVITY_RISE_LIMIT: f64 = 1e-3;

/// Output of one pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedReading {
    /// Filtered gravity, SG.
    pub gravity_filtered: Option<f64>,
    /// Filtered temperature, °C.
    pub temperature_filtered: Option<f64>,
    /// Gravity slope, SG per hour.
    pub gravity_rate: f64,
    /// Temperature slope, °C per hour.
    pub temperature_rate: f64,
    /// Filter confidence, the minimum across active tracks.
    pub confidence: f64,
    /// Whether any anomaly predicate fired.
    pub is_anomaly: bool,
    /// The predicates that fired.
    pub anomaly_reasons: Vec<String>,
    /// Largest robust z-score across both channels.
    pub anomaly_score: f64,
}

impl ProcessedReading {
    /// The degraded output used when the pipeline itself fails: calibrated
    /// values pass through, rates zero, confidence zero.
    pub fn degraded(gravity: Option<f64>, temperature: Option<f64>) -> Self {
        Self {
            gravity_filtered: gravity,
            temperature_filtered: temperature,
            gravity_rate: 0.0,
            temperature_rate: 0.0,
            confidence: 0.0,
            is_anomaly: false,
            anomaly_reasons: Vec::new(),
            anomaly_score: 0.0,
        }
    }
}

/// One quantity's filter, detector window and rate window.
#[derive(Debug)]
struct Track {
    kalman: ScalarKalman,
    residuals: ResidualWindow,
    rate: RateEstimator,
    last_at: DateTime<Utc>,
}

impl Track {
    fn new(initial: f64, q_per_hour: f64, r: f64, at: DateTime<Utc>) -> Self {
        let mut rate = RateEstimator::new(RATE_WINDOW);
        rate.push(at, initial);
        Self {
            kalman: ScalarKalman::new(initial, P0, q_per_hour, r),
            residuals: ResidualWindow::new(ANOMALY_WINDOW),
            rate,
            last_at: at,
        }
    }
}

/// Per-device pipeline state.
#[derive(Debug, Default)]
struct DeviceProcessingState {
    gravity: Option<Track>,
    temperature: Option<Track>,
}

/// Intermediate per-channel decision data for one pass.
struct ChannelPass {
    residual: f64,
    z: f64,
    /// What the update step would publish.
    candidate: f64,
    /// What skipping the update would publish.
    predicted: f64,
    provisional_rate: f64,
}

/// Keyed registry of per-device pipeline state.
///
/// Callers serialize per device (the ingest manager's per-device lock);
/// the internal mutex only guards the map across devices.
pub struct ProcessorPool {
    db: Arc<Database>,
    states: Mutex<HashMap<String, DeviceProcessingState>>,
}

impl ProcessorPool {
    /// Create an empty pool over the given store.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Run one reading through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error only when the warm-start read fails; the caller
    /// falls back to [`ProcessedReading::degraded`].
    pub async fn process(
        &self,
        device_id: &str,
        gravity_cal: Option<f64>,
        temperature_cal: Option<f64>,
        observed_at: DateTime<Utc>,
    ) -> Result<ProcessedReading> {
        self.ensure_state(device_id).await?;

        let mut states = self.states.lock();
        let state = states.entry(device_id.to_string()).or_default();

        // Stage (a): predict both tracks and measure innovations.
        let gravity_pass = Self::advance_track(
            &mut state.gravity,
            gravity_cal,
            Q_GRAVITY,
            R_GRAVITY,
            observed_at,
        );
        let temperature_pass = Self::advance_track(
            &mut state.temperature,
            temperature_cal,
            Q_TEMPERATURE,
            R_TEMPERATURE,
            observed_at,
        );

        // Stage (c): anomaly predicates over both channels.
        let mut reasons = Vec::new();
        let mut score: f64 = 0.0;
        if let Some(pass) = &gravity_pass {
            score = score.max(pass.z.abs());
            if pass.residual.abs() > GRAVITY_RESIDUAL_LIMIT {
                reasons.push("gravity_jump".to_string());
            }
            if pass.provisional_rate > GRAVITY_RISE_LIMIT {
                reasons.push("gravity_rising".to_string());
            }
            if pass.z > Z_LIMIT {
                reasons.push("gravity_outlier".to_string());
            }
        }
        if let Some(pass) = &temperature_pass {
            score = score.max(pass.z.abs());
            if pass.residual.abs() > TEMPERATURE_RESIDUAL_LIMIT {
                reasons.push("temperature_jump".to_string());
            }
            if pass.z > Z_LIMIT {
                reasons.push("temperature_outlier".to_string());
            }
        }
        let is_anomaly = !reasons.is_empty();

        // Stage (d): commit. Anomalous samples skip the update but the
        // prediction has already advanced; either way the published value
        // joins the rate history and the residual joins the window.
        let gravity_filtered = Self::commit_track(
            &mut state.gravity,
            gravity_cal,
            gravity_pass.as_ref(),
            is_anomaly,
            observed_at,
        );
        let temperature_filtered = Self::commit_track(
            &mut state.temperature,
            temperature_cal,
            temperature_pass.as_ref(),
            is_anomaly,
            observed_at,
        );

        // Stage (b): rates over the committed history.
        let gravity_rate = state
            .gravity
            .as_ref()
            .map(|t| t.rate.slope_per_hour())
            .unwrap_or(0.0);
        let temperature_rate = state
            .temperature
            .as_ref()
            .map(|t| t.rate.slope_per_hour())
            .unwrap_or(0.0);

        let confidence = [&state.gravity, &state.temperature]
            .iter()
            .filter_map(|t| t.as_ref().map(|t| t.kalman.confidence()))
            .fold(f64::INFINITY, f64::min);
        let confidence = if confidence.is_finite() { confidence } else { 0.0 };

        Ok(ProcessedReading {
            gravity_filtered,
            temperature_filtered,
            gravity_rate,
            temperature_rate,
            confidence,
            is_anomaly,
            anomaly_reasons: reasons,
            anomaly_score: score,
        })
    }

    /// Discard a device's pipeline state.
    pub fn reset(&self, device_id: &str) {
        if self.states.lock().remove(device_id).is_some() {
            info!(device_id, "pipeline state reset");
        }
    }

    /// Number of devices with live state.
    pub fn state_count(&self) -> usize {
        self.states.lock().len()
    }

    /// Warm-start a device's state from its most recent valid persisted
    /// reading, once.
    async fn ensure_state(&self, device_id: &str) -> Result<()> {
        if self.states.lock().contains_key(device_id) {
            return Ok(());
        }
        let seed = self.db.latest_valid_reading(device_id).await?;
        let mut states = self.states.lock();
        if states.contains_key(device_id) {
            return Ok(());
        }
        let mut state = DeviceProcessingState::default();
        if let Some(reading) = seed {
            if let Some(g) = reading.gravity_filtered {
                state.gravity = Some(Track::new(g, Q_GRAVITY, R_GRAVITY, reading.timestamp));
            }
            if let Some(t) = reading.temperature_filtered {
                state.temperature =
                    Some(Track::new(t, Q_TEMPERATURE, R_TEMPERATURE, reading.timestamp));
            }
            debug!(
                device_id,
                seeded_at = %reading.timestamp,
                "pipeline state warm-started"
            );
        }
        states.insert(device_id.to_string(), state);
        Ok(())
    }

    /// Predict one track and collect its innovation data. Creates the track
    /// on the channel's first value; returns `None` when there is no
    /// measurement or no history to judge it against.
    fn advance_track(
        track: &mut Option<Track>,
        measurement: Option<f64>,
        q_per_hour: f64,
        r: f64,
        observed_at: DateTime<Utc>,
    ) -> Option<ChannelPass> {
        let z = measurement?;
        match track {
            None => {
                // First sample: seed the estimate, never anomalous.
                *track = Some(Track::new(z, q_per_hour, r, observed_at));
                None
            }
            Some(t) => {
                let dt_hours =
                    (observed_at - t.last_at).num_milliseconds() as f64 / 3_600_000.0;
                t.kalman.predict(dt_hours);
                let residual = t.kalman.residual(z);
                let zscore = t.residuals.robust_z(residual);
                let candidate = t.kalman.peek_update(z);
                let provisional_rate = t.rate.slope_with((observed_at, candidate));
                Some(ChannelPass {
                    residual,
                    z: zscore,
                    candidate,
                    predicted: t.kalman.value(),
                    provisional_rate,
                })
            }
        }
    }

    /// Fold the disposition into the track and return the published value.
    fn commit_track(
        track: &mut Option<Track>,
        measurement: Option<f64>,
        pass: Option<&ChannelPass>,
        is_anomaly: bool,
        observed_at: DateTime<Utc>,
    ) -> Option<f64> {
        let t = track.as_mut()?;
        let z = measurement?;
        let published = match pass {
            // First sample for this track: already seeded by advance_track.
            None => t.kalman.value(),
            Some(pass) => {
                if is_anomaly {
                    pass.predicted
                } else {
                    t.kalman.update(z);
                    pass.candidate
                }
            }
        };
        if let Some(pass) = pass {
            t.residuals.push(pass.residual);
            t.rate.push(observed_at, published);
            t.last_at = observed_at;
        }
        Some(published)
    }
}
