//! Live process configuration.
//!
//! Settings load from the `settings` table at startup, with scanner-related
//! environment variables taking precedence. Updates persist first, then
//! broadcast the new snapshot on a watch channel; components hold the
//! latest snapshot and react at their own well-defined points (the scanner
//! restarts on mode change, the controller re-reads each tick).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::Database;

/// Which scanner variant feeds the ingest funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerMode {
    /// Live BLE adapter.
    Ble,
    /// Synthetic advertisements for development.
    Mock,
    /// Poll JSON snapshot files written by a legacy daemon.
    File,
    /// HTTP-poll a remote host's snapshots.
    Relay,
}

/// Display unit for temperatures (storage is always Celsius).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempUnit {
    C,
    F,
}

/// Display unit for gravities (storage is always SG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GravityUnit {
    #[serde(rename = "SG")]
    Sg,
    Plato,
    Brix,
}

/// The process-wide configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Scanner variant.
    pub scanner_mode: ScannerMode,
    /// Directory of snapshot files for [`ScannerMode::File`].
    pub scanner_files_path: Option<String>,
    /// Remote host for [`ScannerMode::Relay`].
    pub scanner_relay_host: Option<String>,
    /// RSSI floor; readings strictly below are rejected.
    pub min_rssi: i16,
    /// Front-end chart smoothing hint (display-only).
    pub smoothing_enabled: bool,
    /// Front-end smoothing window (display-only).
    pub smoothing_samples: u32,
    /// Display unit for temperatures.
    pub temp_units: TempUnit,
    /// Display unit for gravities.
    pub gravity_units: GravityUnit,
    /// Whether the external switch service is configured.
    pub ha_enabled: bool,
    /// Base URL of the switch service.
    pub ha_url: String,
    /// Bearer token for the switch service.
    pub ha_token: String,
    /// Ambient temperature sensor entity, if any.
    pub ha_ambient_entity_id: Option<String>,
    /// Whether unpaired devices are gated out of persistence.
    pub pairing_required: bool,
    /// Reading retention in days; 0 keeps forever.
    pub cleanup_retention_days: u32,
    /// Minimum seconds between accepted readings per device.
    pub ingest_min_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scanner_mode: ScannerMode::Ble,
            scanner_files_path: None,
            scanner_relay_host: None,
            min_rssi: -90,
            smoothing_enabled: true,
            smoothing_samples: 5,
            temp_units: TempUnit::C,
            gravity_units: GravityUnit::Sg,
            ha_enabled: false,
            ha_url: "http://homeassistant.local:8123".to_string(),
            ha_token: String::new(),
            ha_ambient_entity_id: None,
            pairing_required: true,
            cleanup_retention_days: 0,
            ingest_min_interval_secs: 10,
        }
    }
}

use crate::store::double_option;

/// A partial settings update; absent fields are left unchanged, explicit
/// `null` clears an optional field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub scanner_mode: Option<ScannerMode>,
    #[serde(with = "double_option")]
    pub scanner_files_path: Option<Option<String>>,
    #[serde(with = "double_option")]
    pub scanner_relay_host: Option<Option<String>>,
    pub min_rssi: Option<i16>,
    pub smoothing_enabled: Option<bool>,
    pub smoothing_samples: Option<u32>,
    pub temp_units: Option<TempUnit>,
    pub gravity_units: Option<GravityUnit>,
    pub ha_enabled: Option<bool>,
    pub ha_url: Option<String>,
    pub ha_token: Option<String>,
    #[serde(with = "double_option")]
    pub ha_ambient_entity_id: Option<Option<String>>,
    pub pairing_required: Option<bool>,
    pub cleanup_retention_days: Option<u32>,
    pub ingest_min_interval_secs: Option<u64>,
}

impl SettingsPatch {
    fn apply(&self, settings: &mut Settings) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(value) = self.$field.clone() {
                    settings.$field = value;
                }
            };
        }
        set!(scanner_mode);
        set!(scanner_files_path);
        set!(scanner_relay_host);
        set!(min_rssi);
        set!(smoothing_enabled);
        set!(smoothing_samples);
        set!(temp_units);
        set!(gravity_units);
        set!(ha_enabled);
        set!(ha_url);
        set!(ha_token);
        set!(ha_ambient_entity_id);
        set!(pairing_required);
        set!(cleanup_retention_days);
        set!(ingest_min_interval_secs);
    }
}

/// Owner of the live configuration snapshot.
pub struct ConfigStore {
    db: Arc<Database>,
    tx: watch::Sender<Settings>,
}

impl ConfigStore {
    /// Load settings from the store, apply environment overrides, and
    /// start broadcasting.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings table cannot be read.
    pub async fn load(db: Arc<Database>) -> Result<Self> {
        let persisted: HashMap<String, String> =
            db.load_settings().await?.into_iter().collect();

        let mut value = serde_json::to_value(Settings::default())?;
        if let Some(object) = value.as_object_mut() {
            for (key, raw) in &persisted {
                match serde_json::from_str(raw) {
                    Ok(parsed) => {
                        object.insert(key.clone(), parsed);
                    }
                    Err(_) => warn!(key, "ignoring unparseable persisted setting"),
                }
            }
        }
        let mut settings: Settings = serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("persisted settings did not deserialize ({e}); using defaults");
            Settings::default()
        });

        Self::apply_env_overrides(&mut settings);

        info!(mode = ?settings.scanner_mode, "configuration loaded");
        let (tx, _) = watch::channel(settings);
        Ok(Self { db, tx })
    }

    /// Environment variables win over persisted values at startup.
    fn apply_env_overrides(settings: &mut Settings) {
        if let Ok(value) = std::env::var("SCANNER_MOCK") {
            if matches!(value.as_str(), "1" | "true" | "yes") {
                settings.scanner_mode = ScannerMode::Mock;
            }
        }
        if let Ok(path) = std::env::var("SCANNER_FILES_PATH") {
            if !path.is_empty() {
                settings.scanner_mode = ScannerMode::File;
                settings.scanner_files_path = Some(path);
            }
        }
        if let Ok(host) = std::env::var("SCANNER_RELAY_HOST") {
            if !host.is_empty() {
                settings.scanner_mode = ScannerMode::Relay;
                settings.scanner_relay_host = Some(host);
            }
        }
    }

    /// The current snapshot.
    pub fn get(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Apply a patch: persist, then broadcast the new snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails; the live snapshot is only
    /// replaced after a successful write.
    pub async fn update(&self, patch: &SettingsPatch) -> Result<Settings> {
        let mut settings = self.get();
        patch.apply(&mut settings);

        let value = serde_json::to_value(&settings)?;
        if let Some(object) = value.as_object() {
            for (key, field) in object {
                self.db.save_setting(key, &field.to_string()).await?;
            }
        }

        self.tx.send_replace(settings.clone());
        info!("configuration updated");
        Ok(settings)
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_defaults_when_store_empty() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let config = ConfigStore::load(db).await.unwrap();
        assert_eq!(config.get(), Settings::default());
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let config = ConfigStore::load(db.clone()).await.unwrap();
        let patch = SettingsPatch {
            min_rssi: Some(-75),
            pairing_required: Some(false),
            ..Default::default()
        };
        let updated = config.update(&patch).await.unwrap();
        assert_eq!(updated.min_rssi, -75);
        assert!(!updated.pairing_required);

        // A fresh store over the same database sees the persisted values.
        let reloaded = ConfigStore::load(db).await.unwrap();
        assert_eq!(reloaded.get().min_rssi, -75);
        assert!(!reloaded.get().pairing_required);
    }

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let config = ConfigStore::load(db).await.unwrap();
        let mut rx = config.subscribe();
        config
            .update(&SettingsPatch {
                scanner_mode: Some(ScannerMode::Mock),
                ..Default::default()
            })
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().scanner_mode, ScannerMode::Mock);
    }

    #[test]
    fn test_patch_clears_optional_field() {
        let mut settings = Settings {
            scanner_relay_host: Some("host".to_string()),
            ..Default::default()
        };
        let patch = SettingsPatch {
            scanner_relay_host: Some(None),
            ..Default::default()
        };
        patch.apply(&mut settings);
        assert_eq!(settings.scanner_relay_host, None);
    }

    #[test]
    fn test_patch_json_shape() {
        // Absent fields stay untouched; present fields apply.
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"min_rssi": -70, "temp_units": "F"}"#).unwrap();
        let mut settings = Settings::default();
        patch.apply(&mut settings);
        assert_eq!(settings.min_rssi, -70);
        assert_eq!(settings.temp_units, TempUnit::F);
        assert_eq!(settings.scanner_mode, ScannerMode::Ble);
    }
}
