//! iSpindel and GravityMon HTTP adapters.
//!
//! Both firmwares POST a JSON body of the shape
//! `{name, ID, angle, temperature, temp_units, gravity, battery, RSSI}`.
//! GravityMon extends it with keys such as `corr-gravity`, `gravity-unit`
//! and `run-time`; its adapter sniffs first so the extended schema never
//! falls through to the generic one.

use serde_json::Value;

use crate::adapter::{Adapter, DeviceKind, NormalizedReading, PayloadBody, RawPayload};
use crate::error::AdapterError;
use crate::units::{fahrenheit_to_celsius, plato_to_sg};

/// LiFePO/li-ion pack voltage treated as empty.
const BATTERY_EMPTY_VOLTS: f64 = 3.2;

/// Pack voltage treated as full.
const BATTERY_FULL_VOLTS: f64 = 4.2;

/// Map a reported battery voltage onto a rough percentage.
fn volts_to_percent(volts: f64) -> f64 {
    let span = BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS;
    (100.0 * (volts - BATTERY_EMPTY_VOLTS) / span).clamp(0.0, 100.0)
}

fn required_f64(body: &Value, field: &str) -> Result<f64, AdapterError> {
    body.get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| AdapterError::MissingRequiredField {
            field: field.to_string(),
        })
}

/// Device identity: the self-reported `name`, falling back to numeric `ID`.
fn device_id_of(body: &Value) -> Result<String, AdapterError> {
    if let Some(name) = body.get("name").and_then(Value::as_str) {
        if !name.trim().is_empty() {
            return Ok(name.trim().to_string());
        }
    }
    if let Some(id) = body.get("ID").and_then(Value::as_u64) {
        return Ok(id.to_string());
    }
    Err(AdapterError::MissingRequiredField {
        field: "name".to_string(),
    })
}

fn temperature_c_of(body: &Value) -> Result<f64, AdapterError> {
    let raw = required_f64(body, "temperature")?;
    let units = body
        .get("temp_units")
        .and_then(Value::as_str)
        .unwrap_or("C");
    match units {
        "F" => Ok(fahrenheit_to_celsius(raw)),
        _ => Ok(raw),
    }
}

/// Shared parse body for the iSpindel schema family.
fn parse_spindel_family(
    payload: &RawPayload,
    kind: DeviceKind,
) -> Result<NormalizedReading, AdapterError> {
    let body = match &payload.body {
        PayloadBody::Json(body) => body,
        PayloadBody::Manufacturer { .. } => {
            return Err(AdapterError::Malformed {
                context: format!("{kind} adapter fed a manufacturer payload"),
            })
        }
    };

    let device_id = device_id_of(body)?;
    let temperature_c = temperature_c_of(body)?;
    let reported_gravity = required_f64(body, "gravity")?;

    // GravityMon posts a `corr-gravity` once its own calibration polynomial
    // is configured; prefer it and flag the reading as pre-filtered.
    let (gravity, prefiltered) = match body.get("corr-gravity").and_then(Value::as_f64) {
        Some(corr) if corr.is_finite() => (corr, true),
        _ => (reported_gravity, false),
    };

    // `gravity-unit: "P"` (GravityMon) or an implausibly large value (plain
    // iSpindel configured for Plato) means the number is °P, not SG.
    let unit = body.get("gravity-unit").and_then(Value::as_str);
    let gravity_sg = match unit {
        Some("P") => plato_to_sg(gravity),
        Some(_) => gravity,
        None if gravity > 1.5 => plato_to_sg(gravity),
        None => gravity,
    };

    let battery_percent = body
        .get("battery")
        .and_then(Value::as_f64)
        .map(volts_to_percent);

    let rssi = body
        .get("RSSI")
        .and_then(Value::as_i64)
        .map(|v| v as i16)
        .or(payload.rssi);

    Ok(NormalizedReading {
        device_id,
        kind,
        gravity_sg: Some(gravity_sg),
        temperature_c: Some(temperature_c),
        rssi,
        battery_percent,
        prefiltered_gravity: prefiltered,
        raw_blob: body.to_string(),
        source: payload.source,
        observed_at: payload.observed_at,
    })
}

/// Adapter for the generic iSpindel JSON schema.
pub struct IspindelAdapter;

impl Adapter for IspindelAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Ispindel
    }

    fn sniff(&self, payload: &RawPayload) -> bool {
        match &payload.body {
            PayloadBody::Json(body) => {
                body.get("angle").is_some() && body.get("gravity").is_some()
            }
            PayloadBody::Manufacturer { .. } => false,
        }
    }

    fn parse(&self, payload: &RawPayload) -> Result<NormalizedReading, AdapterError> {
        parse_spindel_family(payload, DeviceKind::Ispindel)
    }
}

/// Adapter for the GravityMon extended schema.
///
/// Sniffed before [`IspindelAdapter`]: every GravityMon body is also a
/// valid iSpindel body.
pub struct GravityMonAdapter;

impl GravityMonAdapter {
    /// Keys only GravityMon emits.
    const MARKER_KEYS: [&'static str; 3] = ["corr-gravity", "gravity-unit", "run-time"];
}

impl Adapter for GravityMonAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Gravitymon
    }

    fn sniff(&self, payload: &RawPayload) -> bool {
        match &payload.body {
            PayloadBody::Json(body) => {
                body.get("gravity").is_some()
                    && Self::MARKER_KEYS.iter().any(|k| body.get(k).is_some())
            }
            PayloadBody::Manufacturer { .. } => false,
        }
    }

    fn parse(&self, payload: &RawPayload) -> Result<NormalizedReading, AdapterError> {
        parse_spindel_family(payload, DeviceKind::Gravitymon)
    }
}
