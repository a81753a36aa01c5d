//! SQLite persistence adapter.
//!
//! The single writer to the relational store. Schema evolution is strictly
//! additive: every migration statement is idempotent and re-checked on
//! startup. All timestamps are UTC, all gravities SG, all temperatures
//! Celsius.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Upper bound on any range query.
pub const MAX_QUERY_LIMIT: i64 = 5000;

/// Page size for the CSV export walk.
pub const EXPORT_PAGE_SIZE: i64 = 1000;

/// Disposition of a persisted reading.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ReadingStatus {
    /// Within physical ranges and calibrated.
    Valid,
    /// Outside physical validity ranges; excluded from the pipeline.
    Invalid,
    /// No calibration curve stored for the device.
    Uncalibrated,
    /// The payload lacked one of the two quantities.
    Incomplete,
}

impl ReadingStatus {
    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Uncalibrated => "uncalibrated",
            Self::Incomplete => "incomplete",
        }
    }
}

/// Lifecycle state of a batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Being planned; no control.
    Planning,
    /// Actively fermenting; eligible for temperature control.
    Fermenting,
    /// Conditioning after fermentation.
    Conditioning,
    /// Finished.
    Completed,
    /// Archived for the record books.
    Archived,
}

impl BatchStatus {
    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Fermenting => "fermenting",
            Self::Conditioning => "conditioning",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }
}

/// A registered hydrometer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    /// Stable identity: BLE MAC, color-tagged Tilt id, or self-reported id.
    pub id: String,
    /// Device family (`tilt`, `ispindel`, `gravitymon`, `rapt`).
    pub kind: String,
    /// Operator-facing display name.
    pub name: String,
    /// The unit the device natively reports gravity in.
    pub native_gravity_unit: String,
    /// The unit the device natively reports temperature in.
    pub native_temperature_unit: String,
    /// Whether readings from this device are persisted.
    pub paired: bool,
    /// Last time any payload arrived from this device.
    pub last_seen: Option<DateTime<Utc>>,
    /// Gravity calibration curve as JSON, if configured.
    pub gravity_calibration: Option<String>,
    /// Temperature calibration curve as JSON, if configured.
    pub temperature_calibration: Option<String>,
}

/// One persisted observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    /// Row id; monotonic in observation order per device.
    pub id: i64,
    /// The device the observation came from.
    pub device_id: String,
    /// Observation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Gravity as reported, SG.
    pub gravity_raw: Option<f64>,
    /// Gravity after the device's calibration curve.
    pub gravity_calibrated: Option<f64>,
    /// Gravity after Kalman filtering.
    pub gravity_filtered: Option<f64>,
    /// Temperature as reported, Celsius.
    pub temperature_raw: Option<f64>,
    /// Temperature after calibration.
    pub temperature_calibrated: Option<f64>,
    /// Temperature after Kalman filtering.
    pub temperature_filtered: Option<f64>,
    /// Radio signal strength, dBm.
    pub rssi: Option<i64>,
    /// Filter confidence in `[0, 1]`.
    pub confidence: f64,
    /// Gravity slope, SG per hour.
    pub gravity_rate: f64,
    /// Temperature slope, °C per hour.
    pub temperature_rate: f64,
    /// Whether the anomaly detector flagged this sample.
    pub is_anomaly: bool,
    /// Largest robust z-score across both channels.
    pub anomaly_score: f64,
    /// Comma-separated list of fired predicates.
    pub anomaly_reasons: String,
    /// The fermenting batch linked at ingest time, if any. Never rewritten.
    pub batch_id: Option<i64>,
    /// Disposition of the reading.
    pub status: ReadingStatus,
}

/// Fields for a reading about to be persisted.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub gravity_raw: Option<f64>,
    pub gravity_calibrated: Option<f64>,
    pub gravity_filtered: Option<f64>,
    pub temperature_raw: Option<f64>,
    pub temperature_calibrated: Option<f64>,
    pub temperature_filtered: Option<f64>,
    pub rssi: Option<i64>,
    pub confidence: f64,
    pub gravity_rate: f64,
    pub temperature_rate: f64,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    pub anomaly_reasons: String,
    pub batch_id: Option<i64>,
    pub status: ReadingStatus,
}

/// A brew batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Batch {
    /// Row id.
    pub id: i64,
    /// The hydrometer linked to this batch.
    pub device_id: Option<String>,
    /// External recipe reference.
    pub recipe_id: Option<i64>,
    /// Operator-facing sequence number.
    pub batch_number: i64,
    /// Lifecycle state.
    pub status: BatchStatus,
    /// When fermentation started.
    pub start_time: Option<DateTime<Utc>>,
    /// When fermentation ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Measured original gravity.
    pub measured_og: Option<f64>,
    /// Measured final gravity.
    pub measured_fg: Option<f64>,
    /// Switch entity for the heater.
    pub heater_entity: Option<String>,
    /// Switch entity for the cooler.
    pub cooler_entity: Option<String>,
    /// Control target, °C.
    pub temp_target: Option<f64>,
    /// Hysteresis half-band, °C.
    pub temp_hysteresis: Option<f64>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Serde helper for patch fields: distinguishes an absent field (leave the
/// column unchanged) from an explicit `null` (clear it).
pub(crate) mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Patchable batch fields; an absent field leaves the column unchanged,
/// an explicit `null` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchPatch {
    #[serde(with = "double_option")]
    pub device_id: Option<Option<String>>,
    pub status: Option<BatchStatus>,
    #[serde(with = "double_option")]
    pub measured_og: Option<Option<f64>>,
    #[serde(with = "double_option")]
    pub measured_fg: Option<Option<f64>>,
    #[serde(with = "double_option")]
    pub heater_entity: Option<Option<String>>,
    #[serde(with = "double_option")]
    pub cooler_entity: Option<Option<String>>,
    #[serde(with = "double_option")]
    pub temp_target: Option<Option<f64>>,
    #[serde(with = "double_option")]
    pub temp_hysteresis: Option<Option<f64>>,
}

/// Idempotent schema statements, applied in order on every startup.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        native_gravity_unit TEXT NOT NULL DEFAULT 'SG',
        native_temperature_unit TEXT NOT NULL DEFAULT 'C',
        paired INTEGER NOT NULL DEFAULT 0,
        last_seen TIMESTAMP,
        gravity_calibration TEXT,
        temperature_calibration TEXT
    )",
    "CREATE TABLE IF NOT EXISTS batches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT REFERENCES devices(id),
        recipe_id INTEGER,
        batch_number INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'planning',
        start_time TIMESTAMP,
        end_time TIMESTAMP,
        measured_og REAL,
        measured_fg REAL,
        heater_entity TEXT,
        cooler_entity TEXT,
        temp_target REAL,
        temp_hysteresis REAL,
        deleted_at TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL REFERENCES devices(id),
        timestamp TIMESTAMP NOT NULL,
        gravity_raw REAL,
        gravity_calibrated REAL,
        gravity_filtered REAL,
        temperature_raw REAL,
        temperature_calibrated REAL,
        temperature_filtered REAL,
        rssi INTEGER,
        confidence REAL NOT NULL DEFAULT 0,
        gravity_rate REAL NOT NULL DEFAULT 0,
        temperature_rate REAL NOT NULL DEFAULT 0,
        is_anomaly INTEGER NOT NULL DEFAULT 0,
        anomaly_score REAL NOT NULL DEFAULT 0,
        anomaly_reasons TEXT NOT NULL DEFAULT '',
        batch_id INTEGER REFERENCES batches(id),
        status TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_readings_device_time
        ON readings(device_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_readings_batch_time
        ON readings(batch_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Handle to the SQLite store.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a migration fails.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Writes are serialized through one connection; the ingest rate of a
        // handful of hydrometers never needs more.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // An in-memory database lives and dies with its connection; the
        // pool must never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database migrations applied ({} statements)", MIGRATIONS.len());
        Ok(())
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Insert the device if unknown, always refreshing `last_seen`.
    ///
    /// Auto-created devices start unpaired.
    pub async fn upsert_device(
        &self,
        id: &str,
        kind: &str,
        native_gravity_unit: &str,
        native_temperature_unit: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Device> {
        let device = sqlx::query_as::<_, Device>(
            "INSERT INTO devices
                (id, kind, name, native_gravity_unit, native_temperature_unit, paired, last_seen)
             VALUES (?1, ?2, ?1, ?3, ?4, 0, ?5)
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen
             RETURNING *",
        )
        .bind(id)
        .bind(kind)
        .bind(native_gravity_unit)
        .bind(native_temperature_unit)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(device)
    }

    /// Fetch a device by id.
    pub async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    /// All registered devices, most recently seen first.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices =
            sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY last_seen DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(devices)
    }

    /// Update operator-settable device fields.
    pub async fn update_device(
        &self,
        id: &str,
        name: Option<&str>,
        paired: Option<bool>,
        native_gravity_unit: Option<&str>,
        native_temperature_unit: Option<&str>,
    ) -> Result<Device> {
        let device = sqlx::query_as::<_, Device>(
            "UPDATE devices SET
                name = COALESCE(?2, name),
                paired = COALESCE(?3, paired),
                native_gravity_unit = COALESCE(?4, native_gravity_unit),
                native_temperature_unit = COALESCE(?5, native_temperature_unit)
             WHERE id = ?1
             RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(paired)
        .bind(native_gravity_unit)
        .bind(native_temperature_unit)
        .fetch_optional(&self.pool)
        .await?;
        device.ok_or_else(|| Error::DeviceNotFound {
            device_id: id.to_string(),
        })
    }

    /// Store (or clear) a calibration curve for one quantity.
    pub async fn set_calibration(
        &self,
        id: &str,
        gravity_json: Option<Option<&str>>,
        temperature_json: Option<Option<&str>>,
    ) -> Result<Device> {
        let mut device = self.get_device(id).await?.ok_or_else(|| Error::DeviceNotFound {
            device_id: id.to_string(),
        })?;
        if let Some(json) = gravity_json {
            sqlx::query("UPDATE devices SET gravity_calibration = ?2 WHERE id = ?1")
                .bind(id)
                .bind(json)
                .execute(&self.pool)
                .await?;
            device.gravity_calibration = json.map(str::to_string);
        }
        if let Some(json) = temperature_json {
            sqlx::query("UPDATE devices SET temperature_calibration = ?2 WHERE id = ?1")
                .bind(id)
                .bind(json)
                .execute(&self.pool)
                .await?;
            device.temperature_calibration = json.map(str::to_string);
        }
        Ok(device)
    }

    // ── Readings ─────────────────────────────────────────────────────

    /// Insert one reading, returning its row id.
    pub async fn insert_reading(&self, reading: &NewReading) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO readings
                (device_id, timestamp,
                 gravity_raw, gravity_calibrated, gravity_filtered,
                 temperature_raw, temperature_calibrated, temperature_filtered,
                 rssi, confidence, gravity_rate, temperature_rate,
                 is_anomaly, anomaly_score, anomaly_reasons, batch_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             RETURNING id",
        )
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.gravity_raw)
        .bind(reading.gravity_calibrated)
        .bind(reading.gravity_filtered)
        .bind(reading.temperature_raw)
        .bind(reading.temperature_calibrated)
        .bind(reading.temperature_filtered)
        .bind(reading.rssi)
        .bind(reading.confidence)
        .bind(reading.gravity_rate)
        .bind(reading.temperature_rate)
        .bind(reading.is_anomaly)
        .bind(reading.anomaly_score)
        .bind(&reading.anomaly_reasons)
        .bind(reading.batch_id)
        .bind(reading.status)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0))
    }

    /// The most recent reading for a device, if any.
    pub async fn latest_reading(&self, device_id: &str) -> Result<Option<Reading>> {
        let reading = sqlx::query_as::<_, Reading>(
            "SELECT * FROM readings WHERE device_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reading)
    }

    /// The most recent non-anomalous, in-range reading; the pipeline
    /// warm-start seed.
    pub async fn latest_valid_reading(&self, device_id: &str) -> Result<Option<Reading>> {
        let reading = sqlx::query_as::<_, Reading>(
            "SELECT * FROM readings
             WHERE device_id = ?1 AND is_anomaly = 0
               AND status IN ('valid', 'uncalibrated')
             ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reading)
    }

    /// Readings for a device in `[since, until]`, oldest first, bounded.
    pub async fn readings_in_range(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        let readings = sqlx::query_as::<_, Reading>(
            "SELECT * FROM readings
             WHERE device_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC LIMIT ?4",
        )
        .bind(device_id)
        .bind(since)
        .bind(until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(readings)
    }

    /// Recent readings for a batch, oldest first, bounded; the controller's
    /// MPC history slice.
    pub async fn recent_batch_readings(
        &self,
        batch_id: i64,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        let mut readings = sqlx::query_as::<_, Reading>(
            "SELECT * FROM readings WHERE batch_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )
        .bind(batch_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        readings.reverse();
        Ok(readings)
    }

    /// A page of readings across all devices, id-ascending; the CSV export
    /// walk.
    pub async fn readings_page(&self, after_id: i64, limit: i64) -> Result<Vec<Reading>> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        let readings = sqlx::query_as::<_, Reading>(
            "SELECT * FROM readings WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(readings)
    }

    /// Delete readings older than `cutoff`, returning the count.
    pub async fn delete_readings_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM readings WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let count = result.rows_affected();
        if count > 0 {
            debug!(count, "retention cleanup removed readings");
        }
        Ok(count)
    }

    /// Ids of soft-deleted batches, the input to the orphan sweep.
    pub async fn deleted_batch_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM batches WHERE deleted_at IS NOT NULL ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>(0)).collect())
    }

    /// Ids of readings linked to soft-deleted batches.
    pub async fn orphaned_readings(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT r.id FROM readings r
             JOIN batches b ON r.batch_id = b.id
             WHERE b.deleted_at IS NOT NULL
             ORDER BY r.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>(0)).collect())
    }

    /// Delete all readings belonging to the given batches.
    pub async fn delete_readings_by_batch(&self, batch_ids: &[i64]) -> Result<u64> {
        let mut total = 0;
        for id in batch_ids {
            let result = sqlx::query("DELETE FROM readings WHERE batch_id = ?1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            total += result.rows_affected();
        }
        Ok(total)
    }

    // ── Batches ──────────────────────────────────────────────────────

    /// Create a batch in `planning`.
    pub async fn create_batch(
        &self,
        device_id: Option<&str>,
        recipe_id: Option<i64>,
        batch_number: i64,
    ) -> Result<Batch> {
        let batch = sqlx::query_as::<_, Batch>(
            "INSERT INTO batches (device_id, recipe_id, batch_number, status)
             VALUES (?1, ?2, ?3, 'planning')
             RETURNING *",
        )
        .bind(device_id)
        .bind(recipe_id)
        .bind(batch_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(batch)
    }

    /// Fetch a non-deleted batch by id.
    pub async fn get_batch(&self, id: i64) -> Result<Option<Batch>> {
        let batch = sqlx::query_as::<_, Batch>(
            "SELECT * FROM batches WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(batch)
    }

    /// All non-deleted batches, newest first.
    pub async fn list_batches(&self) -> Result<Vec<Batch>> {
        let batches = sqlx::query_as::<_, Batch>(
            "SELECT * FROM batches WHERE deleted_at IS NULL ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    /// The single fermenting batch for a device, if any.
    pub async fn active_batch_for_device(&self, device_id: &str) -> Result<Option<Batch>> {
        let batch = sqlx::query_as::<_, Batch>(
            "SELECT * FROM batches
             WHERE device_id = ?1 AND status = 'fermenting' AND deleted_at IS NULL
             ORDER BY id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(batch)
    }

    /// Fermenting batches eligible for temperature control: linked device,
    /// a target, and at least one actuator.
    pub async fn active_control_batches(&self) -> Result<Vec<Batch>> {
        let batches = sqlx::query_as::<_, Batch>(
            "SELECT * FROM batches
             WHERE status = 'fermenting' AND deleted_at IS NULL
               AND device_id IS NOT NULL AND temp_target IS NOT NULL
               AND (heater_entity IS NOT NULL OR cooler_entity IS NOT NULL)
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    /// Apply a patch to a batch, enforcing the at-most-one-fermenting
    /// invariant on status transitions.
    pub async fn update_batch(&self, id: i64, patch: &BatchPatch) -> Result<Batch> {
        let current = self
            .get_batch(id)
            .await?
            .ok_or(Error::BatchNotFound { batch_id: id })?;

        let device_id = match &patch.device_id {
            Some(value) => value.clone(),
            None => current.device_id.clone(),
        };
        let status = patch.status.unwrap_or(current.status);

        if status == BatchStatus::Fermenting {
            if let Some(device) = &device_id {
                if let Some(other) = self.active_batch_for_device(device).await? {
                    if other.id != id {
                        return Err(Error::InvalidBatchTransition {
                            reason: format!(
                                "device {device} already has fermenting batch {}",
                                other.id
                            ),
                        });
                    }
                }
            }
        }

        // Entering fermenting stamps start_time; leaving it stamps end_time.
        let entering = status == BatchStatus::Fermenting
            && current.status != BatchStatus::Fermenting;
        let leaving = status != BatchStatus::Fermenting
            && current.status == BatchStatus::Fermenting;
        let now = Utc::now();

        let batch = sqlx::query_as::<_, Batch>(
            "UPDATE batches SET
                device_id = ?2,
                status = ?3,
                start_time = CASE WHEN ?4 THEN ?5 ELSE start_time END,
                end_time = CASE WHEN ?6 THEN ?5 ELSE end_time END,
                measured_og = ?7,
                measured_fg = ?8,
                heater_entity = ?9,
                cooler_entity = ?10,
                temp_target = ?11,
                temp_hysteresis = ?12
             WHERE id = ?1 AND deleted_at IS NULL
             RETURNING *",
        )
        .bind(id)
        .bind(&device_id)
        .bind(status)
        .bind(entering)
        .bind(now)
        .bind(leaving)
        .bind(patch.measured_og.clone().unwrap_or(current.measured_og))
        .bind(patch.measured_fg.clone().unwrap_or(current.measured_fg))
        .bind(
            patch
                .heater_entity
                .clone()
                .unwrap_or(current.heater_entity),
        )
        .bind(
            patch
                .cooler_entity
                .clone()
                .unwrap_or(current.cooler_entity),
        )
        .bind(patch.temp_target.clone().unwrap_or(current.temp_target))
        .bind(
            patch
                .temp_hysteresis
                .clone()
                .unwrap_or(current.temp_hysteresis),
        )
        .fetch_optional(&self.pool)
        .await?;
        batch.ok_or(Error::BatchNotFound { batch_id: id })
    }

    /// Soft-delete a batch.
    pub async fn delete_batch(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE batches SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::BatchNotFound { batch_id: id });
        }
        Ok(())
    }

    // ── Settings ─────────────────────────────────────────────────────

    /// Load all persisted settings as key/value pairs.
    pub async fn load_settings(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    /// Persist one setting.
    pub async fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
