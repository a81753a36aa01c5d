//! The ingest funnel.
//!
//! Every reading — BLE, HTTP, file or relay — passes through
//! [`IngestManager::ingest`] exactly once: device upsert, pairing gate,
//! throttle, RSSI floor, validity check, calibration, the per-device
//! pipeline, batch linkage, persistence, broadcast. Per-device calls are
//! serialized by a per-device async lock; different devices proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::adapter::{DeviceKind, NormalizedReading};
use crate::calibration::CalibrationCurve;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::hub::{BroadcastHub, ReadingSnapshot};
use crate::pipeline::{ProcessedReading, ProcessorPool};
use crate::store::{Database, Device, NewReading, ReadingStatus};

/// Physical validity bounds for gravity, SG.
pub const GRAVITY_RANGE: std::ops::RangeInclusive<f64> = 0.5..=1.2;

/// Physical validity bounds for temperature, °C.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// Why a reading was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// RSSI strictly below the configured floor.
    WeakSignal,
}

impl RejectReason {
    /// The wire string for HTTP responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeakSignal => "weak_signal",
        }
    }
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Persisted and broadcast.
    Accepted {
        /// The new reading's row id.
        reading_id: i64,
    },
    /// Dropped without persistence.
    Rejected {
        /// Why.
        reason: RejectReason,
    },
    /// Inside the per-device minimum interval; dropped.
    Throttled,
    /// The device is discoverable but unpaired; `last_seen` was updated,
    /// nothing was persisted.
    DeviceUnpaired,
}

/// Per-device serialization point and throttle memory.
#[derive(Debug, Default)]
struct DeviceGate {
    last_accepted_at: Option<DateTime<Utc>>,
    /// Whether the throttle was warm-started from the store.
    warmed: bool,
}

/// The single funnel for all readings.
pub struct IngestManager {
    db: Arc<Database>,
    pipeline: Arc<ProcessorPool>,
    hub: Arc<BroadcastHub>,
    config: Arc<ConfigStore>,
    gates: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<DeviceGate>>>>,
}

impl IngestManager {
    /// Wire the funnel to its collaborators.
    pub fn new(
        db: Arc<Database>,
        pipeline: Arc<ProcessorPool>,
        hub: Arc<BroadcastHub>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            db,
            pipeline,
            hub,
            config,
            gates: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one normalized reading.
    ///
    /// # Errors
    ///
    /// Returns an error only on a persistence failure; every upstream
    /// condition maps to an [`IngestOutcome`].
    pub async fn ingest(&self, reading: NormalizedReading) -> Result<IngestOutcome> {
        let gate = self.gate_for(&reading.device_id);
        let mut gate = gate.lock().await;

        // 1. Device upsert; auto-created devices start unpaired.
        let (gravity_unit, temperature_unit) = native_units(reading.kind);
        let device = self
            .db
            .upsert_device(
                &reading.device_id,
                reading.kind.as_str(),
                gravity_unit,
                temperature_unit,
                reading.observed_at,
            )
            .await?;

        let settings = self.config.get();

        // 2. Pairing gate, after the upsert so the device stays
        // discoverable.
        if settings.pairing_required && !device.paired {
            debug!(device_id = %reading.device_id, "reading from unpaired device");
            return Ok(IngestOutcome::DeviceUnpaired);
        }

        // 3. Throttle, warm-started from the store so a restart admits no
        // extra rows.
        if !gate.warmed {
            gate.warmed = true;
            if let Some(last) = self.db.latest_reading(&reading.device_id).await? {
                gate.last_accepted_at = Some(last.timestamp);
            }
        }
        let min_interval = Duration::seconds(settings.ingest_min_interval_secs as i64);
        if let Some(last) = gate.last_accepted_at {
            if reading.observed_at - last < min_interval {
                return Ok(IngestOutcome::Throttled);
            }
        }

        // 4. RSSI floor; exactly at the floor is accepted.
        if let Some(rssi) = reading.rssi {
            if rssi < settings.min_rssi {
                return Ok(IngestOutcome::Rejected {
                    reason: RejectReason::WeakSignal,
                });
            }
        }

        // 5. Validity. Out-of-range readings are persisted so operators can
        // see the noise, but never reach the pipeline.
        let gravity_ok = reading.gravity_sg.map_or(true, |g| GRAVITY_RANGE.contains(&g));
        let temperature_ok = reading
            .temperature_c
            .map_or(true, |t| TEMPERATURE_RANGE.contains(&t));
        let mut status = if !gravity_ok || !temperature_ok {
            ReadingStatus::Invalid
        } else if reading.gravity_sg.is_none() || reading.temperature_c.is_none() {
            ReadingStatus::Incomplete
        } else {
            ReadingStatus::Valid
        };

        // 6. Calibration. A present quantity without a curve marks the
        // reading uncalibrated unless it is already invalid; missing
        // calibration outranks missing channels.
        let (gravity_cal, temperature_cal, calibrated) = apply_calibration(&device, &reading);
        if status != ReadingStatus::Invalid && !calibrated {
            status = ReadingStatus::Uncalibrated;
        }

        // 7. Per-device pipeline, with graceful degradation: a pipeline
        // fault falls back to calibrated values and zero confidence.
        let processed = if status == ReadingStatus::Invalid {
            ProcessedReading::degraded(None, None)
        } else {
            match self
                .pipeline
                .process(
                    &reading.device_id,
                    gravity_cal,
                    temperature_cal,
                    reading.observed_at,
                )
                .await
            {
                Ok(processed) => processed,
                Err(e) => {
                    warn!(device_id = %reading.device_id, "pipeline error, degrading: {e}");
                    ProcessedReading::degraded(gravity_cal, temperature_cal)
                }
            }
        };

        // 8. Batch linkage: the single fermenting batch at ingest time.
        let batch_id = self
            .db
            .active_batch_for_device(&reading.device_id)
            .await?
            .map(|b| b.id);

        // 9. Persist.
        let row = NewReading {
            device_id: reading.device_id.clone(),
            timestamp: reading.observed_at,
            gravity_raw: reading.gravity_sg,
            gravity_calibrated: gravity_cal,
            gravity_filtered: processed.gravity_filtered,
            temperature_raw: reading.temperature_c,
            temperature_calibrated: temperature_cal,
            temperature_filtered: processed.temperature_filtered,
            rssi: reading.rssi.map(i64::from),
            confidence: processed.confidence,
            gravity_rate: processed.gravity_rate,
            temperature_rate: processed.temperature_rate,
            is_anomaly: processed.is_anomaly,
            anomaly_score: processed.anomaly_score,
            anomaly_reasons: processed.anomaly_reasons.join(","),
            batch_id,
            status,
        };
        let reading_id = self.db.insert_reading(&row).await?;
        gate.last_accepted_at = Some(reading.observed_at);

        // 10. Broadcast. Anomalous readings are published too; subscribers
        // see the outlier flagged rather than a gap.
        self.hub.publish_reading(ReadingSnapshot {
            device_id: reading.device_id,
            timestamp: reading.observed_at,
            gravity_raw: row.gravity_raw,
            gravity_calibrated: row.gravity_calibrated,
            gravity_filtered: row.gravity_filtered,
            temperature_raw: row.temperature_raw,
            temperature_calibrated: row.temperature_calibrated,
            temperature_filtered: row.temperature_filtered,
            rssi: row.rssi,
            confidence: row.confidence,
            is_anomaly: row.is_anomaly,
        });

        Ok(IngestOutcome::Accepted { reading_id })
    }

    fn gate_for(&self, device_id: &str) -> Arc<tokio::sync::Mutex<DeviceGate>> {
        self.gates
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }
}

/// The units a device family natively reports in.
fn native_units(kind: DeviceKind) -> (&'static str, &'static str) {
    match kind {
        DeviceKind::Tilt => ("SG", "F"),
        DeviceKind::Rapt => ("SG", "C"),
        DeviceKind::Ispindel | DeviceKind::Gravitymon => ("SG", "C"),
    }
}

/// Apply stored curves; returns `(gravity, temperature, fully_calibrated)`.
///
/// A quantity without a curve passes through raw. A curve that fails to
/// parse is treated as absent (and logged) rather than blocking ingest.
fn apply_calibration(
    device: &Device,
    reading: &NormalizedReading,
) -> (Option<f64>, Option<f64>, bool) {
    let mut calibrated = true;

    let gravity = match (&reading.gravity_sg, &device.gravity_calibration) {
        (Some(raw), Some(json)) => match CalibrationCurve::from_json(json) {
            Ok(curve) => Some(curve.apply(*raw)),
            Err(e) => {
                warn!(device_id = %device.id, "unusable gravity calibration: {e}");
                calibrated = false;
                Some(*raw)
            }
        },
        (Some(raw), None) => {
            calibrated = false;
            Some(*raw)
        }
        (None, _) => None,
    };

    let temperature = match (&reading.temperature_c, &device.temperature_calibration) {
        (Some(raw), Some(json)) => match CalibrationCurve::from_json(json) {
            Ok(curve) => Some(curve.apply(*raw)),
            Err(e) => {
                warn!(device_id = %device.id, "unusable temperature calibration: {e}");
                calibrated = false;
                Some(*raw)
            }
        },
        (Some(raw), None) => {
            calibrated = false;
            Some(*raw)
        }
        (None, _) => None,
    };

    (gravity, temperature, calibrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SourceProtocol;
    use crate::config::SettingsPatch;
    use crate::store::{BatchPatch, BatchStatus};
    use chrono::Duration as ChronoDuration;

    struct Rig {
        db: Arc<Database>,
        config: Arc<ConfigStore>,
        manager: IngestManager,
    }

    async fn rig() -> Rig {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let config = Arc::new(ConfigStore::load(db.clone()).await.unwrap());
        let pipeline = Arc::new(ProcessorPool::new(db.clone()));
        let hub = Arc::new(BroadcastHub::new());
        let manager = IngestManager::new(db.clone(), pipeline, hub, config.clone());
        Rig { db, config, manager }
    }

    fn tilt_reading(at: DateTime<Utc>) -> NormalizedReading {
        NormalizedReading {
            device_id: "tilt-blue".to_string(),
            kind: DeviceKind::Tilt,
            gravity_sg: Some(1.0452),
            temperature_c: Some(20.1),
            rssi: Some(-60),
            battery_percent: None,
            prefiltered_gravity: false,
            raw_blob: "test".to_string(),
            source: SourceProtocol::Ble,
            observed_at: at,
        }
    }

    async fn pair(rig: &Rig, device_id: &str) {
        // First contact auto-creates the device; then the admin pairs it.
        rig.db
            .upsert_device(device_id, "tilt", "SG", "F", Utc::now())
            .await
            .unwrap();
        rig.db
            .update_device(device_id, None, Some(true), None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unpaired_device_gated_but_discoverable() {
        let rig = rig().await;
        let outcome = rig.manager.ingest(tilt_reading(Utc::now())).await.unwrap();
        assert_eq!(outcome, IngestOutcome::DeviceUnpaired);

        // The device row exists, unpaired, with last_seen set; no reading.
        let device = rig.db.get_device("tilt-blue").await.unwrap().unwrap();
        assert!(!device.paired);
        assert!(device.last_seen.is_some());
        assert!(rig.db.latest_reading("tilt-blue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pairing_unlocks_persistence() {
        let rig = rig().await;
        rig.manager.ingest(tilt_reading(Utc::now())).await.unwrap();
        pair(&rig, "tilt-blue").await;

        let outcome = rig
            .manager
            .ingest(tilt_reading(Utc::now() + ChronoDuration::seconds(30)))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        let reading = rig.db.latest_reading("tilt-blue").await.unwrap().unwrap();
        assert_eq!(reading.gravity_raw, Some(1.0452));
        assert_eq!(reading.status, ReadingStatus::Uncalibrated);
    }

    #[tokio::test]
    async fn test_pairing_gate_can_be_disabled() {
        let rig = rig().await;
        rig.config
            .update(&SettingsPatch {
                pairing_required: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        let outcome = rig.manager.ingest(tilt_reading(Utc::now())).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_throttle_drops_rebroadcast() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let t0 = Utc::now();

        let first = rig.manager.ingest(tilt_reading(t0)).await.unwrap();
        assert!(matches!(first, IngestOutcome::Accepted { .. }));

        // Three seconds later with Δ_min = 10: throttled, no new row.
        let second = rig
            .manager
            .ingest(tilt_reading(t0 + ChronoDuration::seconds(3)))
            .await
            .unwrap();
        assert_eq!(second, IngestOutcome::Throttled);

        let third = rig
            .manager
            .ingest(tilt_reading(t0 + ChronoDuration::seconds(10)))
            .await
            .unwrap();
        assert!(matches!(third, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_throttle_survives_restart() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let t0 = Utc::now();
        rig.manager.ingest(tilt_reading(t0)).await.unwrap();

        // A fresh manager over the same store: the throttle warm-starts
        // from the persisted reading, so the re-broadcast is still dropped.
        let pipeline = Arc::new(ProcessorPool::new(rig.db.clone()));
        let hub = Arc::new(BroadcastHub::new());
        let fresh = IngestManager::new(
            rig.db.clone(),
            pipeline,
            hub,
            rig.config.clone(),
        );
        let outcome = fresh
            .ingest(tilt_reading(t0 + ChronoDuration::seconds(3)))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Throttled);
    }

    #[tokio::test]
    async fn test_rssi_floor_is_exclusive() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        rig.config
            .update(&SettingsPatch {
                min_rssi: Some(-70),
                ..Default::default()
            })
            .await
            .unwrap();
        let t0 = Utc::now();

        // Exactly at the floor: accepted.
        let mut at_floor = tilt_reading(t0);
        at_floor.rssi = Some(-70);
        assert!(matches!(
            rig.manager.ingest(at_floor).await.unwrap(),
            IngestOutcome::Accepted { .. }
        ));

        // One below: rejected.
        let mut below = tilt_reading(t0 + ChronoDuration::seconds(30));
        below.rssi = Some(-71);
        assert_eq!(
            rig.manager.ingest(below).await.unwrap(),
            IngestOutcome::Rejected {
                reason: RejectReason::WeakSignal
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_range_persisted_as_invalid() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let mut reading = tilt_reading(Utc::now());
        reading.gravity_sg = Some(1.4);

        let outcome = rig.manager.ingest(reading).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        let row = rig.db.latest_reading("tilt-blue").await.unwrap().unwrap();
        assert_eq!(row.status, ReadingStatus::Invalid);
        // Excluded from the pipeline: no filtered values, zero confidence.
        assert_eq!(row.gravity_filtered, None);
        assert_eq!(row.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_incomplete_without_curve_promotes_to_uncalibrated() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let mut reading = tilt_reading(Utc::now());
        reading.temperature_c = None;

        // No curve for the present gravity channel: the missing
        // calibration wins over the missing channel.
        rig.manager.ingest(reading).await.unwrap();
        let row = rig.db.latest_reading("tilt-blue").await.unwrap().unwrap();
        assert_eq!(row.status, ReadingStatus::Uncalibrated);
        assert_eq!(row.temperature_raw, None);
    }

    #[tokio::test]
    async fn test_incomplete_when_present_channel_calibrated() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let gravity_curve = CalibrationCurve::Linear {
            points: vec![(1.000, 1.000), (1.100, 1.100)],
        };
        rig.db
            .set_calibration("tilt-blue", Some(Some(&gravity_curve.to_json())), None)
            .await
            .unwrap();

        let mut reading = tilt_reading(Utc::now());
        reading.temperature_c = None;

        // Every present quantity is calibrated; only the missing channel
        // remains to report.
        rig.manager.ingest(reading).await.unwrap();
        let row = rig.db.latest_reading("tilt-blue").await.unwrap().unwrap();
        assert_eq!(row.status, ReadingStatus::Incomplete);
        assert!((row.gravity_calibrated.unwrap() - 1.0452).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_calibration_applied_and_status_valid() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let gravity_curve = CalibrationCurve::Linear {
            points: vec![(1.000, 1.002), (1.100, 1.102)],
        };
        let temperature_curve = CalibrationCurve::Linear {
            points: vec![(0.0, 0.0), (100.0, 100.0)],
        };
        rig.db
            .set_calibration(
                "tilt-blue",
                Some(Some(&gravity_curve.to_json())),
                Some(Some(&temperature_curve.to_json())),
            )
            .await
            .unwrap();

        rig.manager.ingest(tilt_reading(Utc::now())).await.unwrap();
        let row = rig.db.latest_reading("tilt-blue").await.unwrap().unwrap();
        assert_eq!(row.status, ReadingStatus::Valid);
        assert!((row.gravity_calibrated.unwrap() - 1.0472).abs() < 1e-9);
        assert!((row.temperature_calibrated.unwrap() - 20.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_batch_linkage_at_ingest() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let batch = rig.db.create_batch(Some("tilt-blue"), None, 1).await.unwrap();
        rig.db
            .update_batch(
                batch.id,
                &BatchPatch {
                    status: Some(BatchStatus::Fermenting),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        rig.manager.ingest(tilt_reading(Utc::now())).await.unwrap();
        let row = rig.db.latest_reading("tilt-blue").await.unwrap().unwrap();
        assert_eq!(row.batch_id, Some(batch.id));
    }

    #[tokio::test]
    async fn test_ids_follow_observation_order() {
        let rig = rig().await;
        pair(&rig, "tilt-blue").await;
        let t0 = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = rig
                .manager
                .ingest(tilt_reading(t0 + ChronoDuration::seconds(15 * i)))
                .await
                .unwrap();
            if let IngestOutcome::Accepted { reading_id } = outcome {
                ids.push(reading_id);
            }
        }
        assert_eq!(ids.len(), 5);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
