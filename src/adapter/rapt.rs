//! RAPT Pill adapter.
//!
//! RAPT hydrometers advertise under two manufacturer ids: `16722` (`"RA"`)
//! carries the 23-byte metrics frame decoded here, `17739` (`"KE"`) carries
//! an ASCII firmware-version string. Combined with the payload's leading
//! `"PT"` the metrics frames spell out `"RAPT"` on the wire.

use crate::adapter::{Adapter, DeviceKind, NormalizedReading, PayloadBody, RawPayload};
use crate::error::AdapterError;

/// Manufacturer id of RAPT metrics frames (`"RA"` little-endian).
pub const RAPT_METRICS_COMPANY_ID: u16 = 16722;

/// Manufacturer id of RAPT firmware-version frames (`"KE"` little-endian).
pub const RAPT_VERSION_COMPANY_ID: u16 = 17739;

/// Hardware-revision beacon broadcast by newer pills; carries no metrics.
const HARDWARE_REVISION_BEACON: &[u8] = b"PTdPillG1";

/// Adapter for RAPT Pill metrics advertisements.
pub struct RaptAdapter;

impl RaptAdapter {
    /// Exact size of a metrics frame:
    /// `"PT" version:u8 mac:6 temp:u16 gravity:f32 x:i16 y:i16 z:i16 battery:i16`.
    const METRICS_SIZE: usize = 23;

    /// Payload format versions this adapter decodes.
    const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u8> = 1..=2;
}

impl Adapter for RaptAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Rapt
    }

    fn sniff(&self, payload: &RawPayload) -> bool {
        match &payload.body {
            PayloadBody::Manufacturer {
                company_id, data, ..
            } => {
                // The hardware-revision beacon must be ignored, not parsed;
                // declining to sniff it drops it silently at the router.
                *company_id == RAPT_METRICS_COMPANY_ID
                    && data.starts_with(b"PT")
                    && data.as_ref() != HARDWARE_REVISION_BEACON
            }
            PayloadBody::Json(_) => false,
        }
    }

    fn parse(&self, payload: &RawPayload) -> Result<NormalizedReading, AdapterError> {
        let data = match &payload.body {
            PayloadBody::Manufacturer { data, .. } => data,
            PayloadBody::Json(_) => {
                return Err(AdapterError::Malformed {
                    context: "RAPT adapter fed a JSON payload".to_string(),
                })
            }
        };

        if data.len() != Self::METRICS_SIZE {
            return Err(AdapterError::Malformed {
                context: format!(
                    "metrics frame is {} bytes (expected {})",
                    data.len(),
                    Self::METRICS_SIZE
                ),
            });
        }

        let version = data[2];
        if !Self::SUPPORTED_VERSIONS.contains(&version) {
            return Err(AdapterError::UnsupportedVersion { version });
        }

        let mac = &data[3..9];
        let device_id = mac
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        // All multi-byte fields are big-endian.
        let temp_raw = u16::from_be_bytes([data[9], data[10]]);
        let gravity_raw = f32::from_be_bytes([data[11], data[12], data[13], data[14]]);
        let battery_raw = i16::from_be_bytes([data[21], data[22]]);

        if !gravity_raw.is_finite() {
            return Err(AdapterError::Malformed {
                context: format!("non-finite gravity field: {gravity_raw}"),
            });
        }

        // Temperature is Kelvin scaled by 128; gravity is SG scaled by 1000;
        // battery is percent scaled by 256.
        let temperature_c = f64::from(temp_raw) / 128.0 - 273.15;
        let gravity_sg = f64::from(gravity_raw) / 1000.0;
        let battery_percent = (f64::from(battery_raw) / 256.0).round();

        Ok(NormalizedReading {
            device_id,
            kind: DeviceKind::Rapt,
            gravity_sg: Some(gravity_sg),
            temperature_c: Some(temperature_c),
            rssi: payload.rssi,
            battery_percent: Some(battery_percent),
            prefiltered_gravity: false,
            raw_blob: format!("rapt v{version} temp_raw={temp_raw} gravity_raw={gravity_raw}"),
            source: payload.source,
            observed_at: payload.observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SourceProtocol;
    use bytes::Bytes;
    use chrono::Utc;

    fn metrics_frame(version: u8, temp_c: f64, gravity_sg: f64, battery_pct: f64) -> Vec<u8> {
        let mut data = Vec::with_capacity(23);
        data.extend_from_slice(b"PT");
        data.push(version);
        data.extend_from_slice(&[0x78, 0xE3, 0x6D, 0x00, 0x11, 0x22]); // mac
        let temp_raw = ((temp_c + 273.15) * 128.0).round() as u16;
        data.extend_from_slice(&temp_raw.to_be_bytes());
        data.extend_from_slice(&((gravity_sg * 1000.0) as f32).to_be_bytes());
        data.extend_from_slice(&0i16.to_be_bytes()); // x
        data.extend_from_slice(&0i16.to_be_bytes()); // y
        data.extend_from_slice(&0i16.to_be_bytes()); // z
        data.extend_from_slice(&(((battery_pct * 256.0) as i16).to_be_bytes()));
        data
    }

    fn payload(company_id: u16, data: Vec<u8>) -> RawPayload {
        RawPayload {
            body: PayloadBody::Manufacturer {
                address: "78:E3:6D:00:11:22".to_string(),
                company_id,
                data: Bytes::from(data),
            },
            source: SourceProtocol::Ble,
            rssi: Some(-70),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sniff_accepts_metrics_frame() {
        let adapter = RaptAdapter;
        let frame = metrics_frame(1, 19.0, 1.050, 87.0);
        assert!(adapter.sniff(&payload(RAPT_METRICS_COMPANY_ID, frame)));
    }

    #[test]
    fn test_sniff_ignores_hardware_revision_beacon() {
        let adapter = RaptAdapter;
        let beacon = HARDWARE_REVISION_BEACON.to_vec();
        assert!(!adapter.sniff(&payload(RAPT_METRICS_COMPANY_ID, beacon)));
    }

    #[test]
    fn test_sniff_ignores_version_company_id() {
        let adapter = RaptAdapter;
        let frame = metrics_frame(1, 19.0, 1.050, 87.0);
        assert!(!adapter.sniff(&payload(RAPT_VERSION_COMPANY_ID, frame)));
    }

    #[test]
    fn test_parse_metrics() {
        let adapter = RaptAdapter;
        let frame = metrics_frame(1, 18.5, 1.0465, 92.0);
        let reading = adapter.parse(&payload(RAPT_METRICS_COMPANY_ID, frame)).unwrap();
        assert_eq!(reading.device_id, "78:E3:6D:00:11:22");
        assert_eq!(reading.kind, DeviceKind::Rapt);
        assert!((reading.temperature_c.unwrap() - 18.5).abs() < 0.01);
        assert!((reading.gravity_sg.unwrap() - 1.0465).abs() < 1e-4);
        assert_eq!(reading.battery_percent, Some(92.0));
        assert_eq!(reading.rssi, Some(-70));
    }

    #[test]
    fn test_parse_rejects_unsupported_version() {
        let adapter = RaptAdapter;
        let frame = metrics_frame(9, 18.5, 1.0465, 92.0);
        let result = adapter.parse(&payload(RAPT_METRICS_COMPANY_ID, frame));
        assert!(matches!(
            result,
            Err(AdapterError::UnsupportedVersion { version: 9 })
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_frame() {
        let adapter = RaptAdapter;
        let mut frame = metrics_frame(1, 18.5, 1.0465, 92.0);
        frame.truncate(20);
        let result = adapter.parse(&payload(RAPT_METRICS_COMPANY_ID, frame));
        assert!(matches!(result, Err(AdapterError::Malformed { .. })));
    }
}
