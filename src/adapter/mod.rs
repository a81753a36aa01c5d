//! Device payload adapters.
//!
//! Adapters convert source-specific payloads (BLE manufacturer data, HTTP
//! JSON bodies) into a uniform [`NormalizedReading`]. Adapters are
//! stateless; the [`AdapterRegistry`] holds them in a fixed order and
//! dispatches by first match.

pub mod ispindel;
pub mod rapt;
pub mod tilt;

pub use ispindel::{GravityMonAdapter, IspindelAdapter};
pub use rapt::RaptAdapter;
pub use tilt::TiltAdapter;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

/// The kind of hydrometer a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Tilt iBeacon hydrometer.
    Tilt,
    /// iSpindel WiFi hydrometer.
    Ispindel,
    /// GravityMon WiFi hydrometer (iSpindel-derived firmware).
    Gravitymon,
    /// RAPT Pill BLE hydrometer.
    Rapt,
}

impl DeviceKind {
    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tilt => "tilt",
            Self::Ispindel => "ispindel",
            Self::Gravitymon => "gravitymon",
            Self::Rapt => "rapt",
        }
    }

    /// Parse the persisted string form.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "tilt" => Some(Self::Tilt),
            "ispindel" => Some(Self::Ispindel),
            "gravitymon" => Some(Self::Gravitymon),
            "rapt" => Some(Self::Rapt),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transport a payload arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    /// Live BLE advertisement.
    Ble,
    /// HTTP POST from a WiFi device.
    Http,
    /// JSON snapshot file written by a legacy daemon.
    File,
    /// Snapshot polled from a remote relay host.
    Relay,
    /// Synthetic advertisement for development.
    Mock,
}

impl SourceProtocol {
    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ble => "ble",
            Self::Http => "http",
            Self::File => "file",
            Self::Relay => "relay",
            Self::Mock => "mock",
        }
    }
}

/// The source-specific body of a raw observation.
#[derive(Debug, Clone)]
pub enum PayloadBody {
    /// BLE manufacturer-specific data.
    Manufacturer {
        /// The advertising device's address as reported by the radio.
        address: String,
        /// Bluetooth SIG company identifier.
        company_id: u16,
        /// The manufacturer payload bytes.
        data: Bytes,
    },
    /// An HTTP JSON body.
    Json(serde_json::Value),
}

/// A raw observation before adapter routing.
#[derive(Debug, Clone)]
pub struct RawPayload {
    /// The source-specific body.
    pub body: PayloadBody,
    /// Which transport delivered the payload.
    pub source: SourceProtocol,
    /// Signal strength from the radio, if any.
    pub rssi: Option<i16>,
    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
}

/// A device observation normalized to canonical units.
///
/// Gravity is in SG, temperature in Celsius; conversion happens in the
/// adapter, never downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    /// Stable device identity (BLE MAC, color-tagged Tilt id, or the
    /// self-reported id of an HTTP device).
    pub device_id: String,
    /// Which kind of hydrometer produced the reading.
    pub kind: DeviceKind,
    /// Specific gravity, if the payload carried one.
    pub gravity_sg: Option<f64>,
    /// Temperature in Celsius, if the payload carried one.
    pub temperature_c: Option<f64>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Battery charge estimate.
    pub battery_percent: Option<f64>,
    /// The device already applied its own calibration polynomial to the
    /// reported gravity (GravityMon `corr-gravity`).
    pub prefiltered_gravity: bool,
    /// Compact rendering of the source payload, for operator inspection.
    pub raw_blob: String,
    /// Which transport delivered the payload.
    pub source: SourceProtocol,
    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
}

/// A stateless payload adapter for one device family.
pub trait Adapter: Send + Sync {
    /// The device kind this adapter produces.
    fn kind(&self) -> DeviceKind;

    /// Cheap structural test: does this payload look like ours?
    ///
    /// Sniffing must be deterministic — the same payload always yields the
    /// same answer.
    fn sniff(&self, payload: &RawPayload) -> bool;

    /// Parse the payload into a normalized reading.
    ///
    /// # Errors
    ///
    /// Returns an [`AdapterError`] describing why the payload could not be
    /// parsed. Callers drop and never retry.
    fn parse(&self, payload: &RawPayload) -> Result<NormalizedReading, AdapterError>;
}

/// Ordered collection of adapters with first-match routing.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Create the registry in routing order.
    ///
    /// GravityMon sniffs before iSpindel because its schema is a strict
    /// superset of iSpindel's; RAPT sniffs before Tilt because its
    /// manufacturer-id prefix is the cheaper test.
    pub fn new() -> Self {
        Self {
            adapters: vec![
                Box::new(GravityMonAdapter),
                Box::new(RaptAdapter),
                Box::new(IspindelAdapter),
                Box::new(TiltAdapter),
            ],
        }
    }

    /// Route a payload to the first adapter that sniffs it.
    pub fn route(&self, payload: &RawPayload) -> Option<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|a| a.sniff(payload))
            .map(|a| a.as_ref())
    }

    /// Route and parse in one step.
    ///
    /// Returns `Ok(None)` when no adapter recognizes the payload (the
    /// caller discards silently), `Err` when an adapter claimed the payload
    /// but could not parse it.
    pub fn parse(
        &self,
        payload: &RawPayload,
    ) -> Result<Option<NormalizedReading>, AdapterError> {
        match self.route(payload) {
            Some(adapter) => adapter.parse(payload).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_payload(value: serde_json::Value) -> RawPayload {
        RawPayload {
            body: PayloadBody::Json(value),
            source: SourceProtocol::Http,
            rssi: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_device_kind_string_roundtrip() {
        for kind in [
            DeviceKind::Tilt,
            DeviceKind::Ispindel,
            DeviceKind::Gravitymon,
            DeviceKind::Rapt,
        ] {
            assert_eq!(DeviceKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(DeviceKind::from_str("toaster"), None);
    }

    #[test]
    fn test_gravitymon_routes_before_ispindel() {
        let registry = AdapterRegistry::new();
        let payload = http_payload(serde_json::json!({
            "name": "gm1",
            "ID": 99,
            "angle": 40.0,
            "temperature": 19.5,
            "temp_units": "C",
            "gravity": 1.040,
            "corr-gravity": 1.041,
            "battery": 3.9,
            "RSSI": -55,
        }));
        let adapter = registry.route(&payload).expect("should route");
        assert_eq!(adapter.kind(), DeviceKind::Gravitymon);
    }

    #[test]
    fn test_plain_ispindel_routes_to_ispindel() {
        let registry = AdapterRegistry::new();
        let payload = http_payload(serde_json::json!({
            "name": "spindel",
            "ID": 1,
            "angle": 45.0,
            "temperature": 20.0,
            "temp_units": "C",
            "gravity": 1.050,
            "battery": 4.0,
            "RSSI": -60,
        }));
        let adapter = registry.route(&payload).expect("should route");
        assert_eq!(adapter.kind(), DeviceKind::Ispindel);
    }

    #[test]
    fn test_unroutable_payload_is_none() {
        let registry = AdapterRegistry::new();
        let payload = http_payload(serde_json::json!({"hello": "world"}));
        assert!(registry.route(&payload).is_none());
        assert!(registry.parse(&payload).unwrap().is_none());
    }

    #[test]
    fn test_sniff_is_idempotent() {
        let registry = AdapterRegistry::new();
        let payload = http_payload(serde_json::json!({
            "name": "spindel",
            "angle": 45.0,
            "temperature": 20.0,
            "gravity": 1.050,
        }));
        let first = registry.route(&payload).map(|a| a.kind());
        let second = registry.route(&payload).map(|a| a.kind());
        assert_eq!(first, second);
    }
}
