//! Tilt iBeacon adapter.
//!
//! Tilt hydrometers broadcast Apple iBeacon frames whose 16-byte UUID
//! identifies the color and whose major/minor fields carry temperature (°F)
//! and gravity (SG·1000). HD Tilts pack tenths into the same fields.

use crate::adapter::{Adapter, DeviceKind, NormalizedReading, PayloadBody, RawPayload};
use crate::error::AdapterError;
use crate::units::fahrenheit_to_celsius;

/// Apple's Bluetooth SIG company identifier.
pub const APPLE_COMPANY_ID: u16 = 76;

/// iBeacon type and length bytes that open the manufacturer payload.
const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];

/// Tilt UUID family: `a495bbX0c5b14b44b5121370f02d74de` with the color
/// nibble `X` at byte 3.
const TILT_UUID_HEAD: [u8; 3] = [0xa4, 0x95, 0xbb];
const TILT_UUID_TAIL: [u8; 12] = [
    0xc5, 0xb1, 0x4b, 0x44, 0xb5, 0x12, 0x13, 0x70, 0xf0, 0x2d, 0x74, 0xde,
];

/// Tilt color, from the UUID color nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TiltColor {
    /// Red Tilt (`a495bb10…`).
    Red = 1,
    /// Green Tilt.
    Green = 2,
    /// Black Tilt.
    Black = 3,
    /// Purple Tilt.
    Purple = 4,
    /// Orange Tilt.
    Orange = 5,
    /// Blue Tilt.
    Blue = 6,
    /// Yellow Tilt.
    Yellow = 7,
    /// Pink Tilt.
    Pink = 8,
}

impl TiltColor {
    /// Create from the UUID color nibble (1-8).
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Red),
            2 => Some(Self::Green),
            3 => Some(Self::Black),
            4 => Some(Self::Purple),
            5 => Some(Self::Orange),
            6 => Some(Self::Blue),
            7 => Some(Self::Yellow),
            8 => Some(Self::Pink),
            _ => None,
        }
    }

    /// Lowercase color name, used in the device identity.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Black => "black",
            Self::Purple => "purple",
            Self::Orange => "orange",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
            Self::Pink => "pink",
        }
    }
}

impl std::fmt::Display for TiltColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Adapter for Tilt iBeacon advertisements.
pub struct TiltAdapter;

impl TiltAdapter {
    /// Minimum manufacturer payload: prefix + UUID + major + minor + tx.
    const MIN_SIZE: usize = 23;

    /// A gravity minor above this is an HD Tilt reporting SG·10000.
    const HD_MINOR_THRESHOLD: u16 = 2000;

    fn color_of(data: &[u8]) -> Option<TiltColor> {
        if data[2..5] != TILT_UUID_HEAD || data[6..18] != TILT_UUID_TAIL {
            return None;
        }
        // Byte 5 is the color nibble followed by zero: `X0`.
        if data[5] & 0x0F != 0 {
            return None;
        }
        TiltColor::from_raw(data[5] >> 4)
    }
}

impl Adapter for TiltAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Tilt
    }

    fn sniff(&self, payload: &RawPayload) -> bool {
        match &payload.body {
            PayloadBody::Manufacturer {
                company_id, data, ..
            } => {
                *company_id == APPLE_COMPANY_ID
                    && data.len() >= Self::MIN_SIZE
                    && data[0..2] == IBEACON_PREFIX
                    && Self::color_of(data).is_some()
            }
            PayloadBody::Json(_) => false,
        }
    }

    fn parse(&self, payload: &RawPayload) -> Result<NormalizedReading, AdapterError> {
        let (data, rssi) = match &payload.body {
            PayloadBody::Manufacturer { data, .. } => (data, payload.rssi),
            PayloadBody::Json(_) => {
                return Err(AdapterError::Malformed {
                    context: "Tilt adapter fed a JSON payload".to_string(),
                })
            }
        };

        if data.len() < Self::MIN_SIZE {
            return Err(AdapterError::Malformed {
                context: format!(
                    "iBeacon payload too short: {} bytes (need {})",
                    data.len(),
                    Self::MIN_SIZE
                ),
            });
        }

        let color = Self::color_of(data).ok_or_else(|| AdapterError::Malformed {
            context: "UUID not in the Tilt family".to_string(),
        })?;

        // Big-endian major/minor straight after the UUID.
        let major = u16::from_be_bytes([data[18], data[19]]);
        let minor = u16::from_be_bytes([data[20], data[21]]);

        // HD Tilts report °F·10 and SG·10000 in the same fields.
        let (temperature_f, gravity_sg) = if minor > Self::HD_MINOR_THRESHOLD {
            (f64::from(major) / 10.0, f64::from(minor) / 10000.0)
        } else {
            (f64::from(major), f64::from(minor) / 1000.0)
        };

        Ok(NormalizedReading {
            device_id: format!("tilt-{}", color.name()),
            kind: DeviceKind::Tilt,
            gravity_sg: Some(gravity_sg),
            temperature_c: Some(fahrenheit_to_celsius(temperature_f)),
            rssi,
            battery_percent: None,
            prefiltered_gravity: false,
            raw_blob: format!("tilt color={color} major={major} minor={minor}"),
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

    /// Build a Tilt manufacturer payload for the given color nibble.
    fn tilt_frame(color: u8, major: u16, minor: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(23);
        data.extend_from_slice(&IBEACON_PREFIX);
        data.extend_from_slice(&TILT_UUID_HEAD);
        data.push(color << 4);
        data.extend_from_slice(&TILT_UUID_TAIL);
        data.extend_from_slice(&major.to_be_bytes());
        data.extend_from_slice(&minor.to_be_bytes());
        data.push(0x10); // tx_power, repurposed as battery age
        data
    }

    fn payload(data: Vec<u8>) -> RawPayload {
        RawPayload {
            body: PayloadBody::Manufacturer {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                company_id: APPLE_COMPANY_ID,
                data: Bytes::from(data),
            },
            source: SourceProtocol::Ble,
            rssi: Some(-58),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sniff_accepts_family_uuid() {
        let adapter = TiltAdapter;
        assert!(adapter.sniff(&payload(tilt_frame(6, 68, 1045))));
    }

    #[test]
    fn test_sniff_rejects_foreign_uuid() {
        let adapter = TiltAdapter;
        let mut frame = tilt_frame(6, 68, 1045);
        frame[10] ^= 0xFF;
        assert!(!adapter.sniff(&payload(frame)));
    }

    #[test]
    fn test_sniff_rejects_color_nibble_out_of_range() {
        let adapter = TiltAdapter;
        assert!(!adapter.sniff(&payload(tilt_frame(0, 68, 1045))));
        assert!(!adapter.sniff(&payload(tilt_frame(9, 68, 1045))));
    }

    #[test]
    fn test_parse_standard_tilt() {
        let adapter = TiltAdapter;
        let reading = adapter.parse(&payload(tilt_frame(1, 68, 1045))).unwrap();
        assert_eq!(reading.device_id, "tilt-red");
        assert_eq!(reading.kind, DeviceKind::Tilt);
        assert!((reading.gravity_sg.unwrap() - 1.045).abs() < 1e-9);
        assert!((reading.temperature_c.unwrap() - 20.0).abs() < 0.001);
        assert_eq!(reading.rssi, Some(-58));
    }

    #[test]
    fn test_parse_hd_tilt_blue() {
        // The HD Blue scenario: major=682 (68.2°F), minor=10452 (1.0452 SG).
        let adapter = TiltAdapter;
        let reading = adapter.parse(&payload(tilt_frame(6, 682, 10452))).unwrap();
        assert_eq!(reading.device_id, "tilt-blue");
        assert!((reading.gravity_sg.unwrap() - 1.0452).abs() < 1e-9);
        assert!((reading.temperature_c.unwrap() - 20.111).abs() < 0.001);
    }

    #[test]
    fn test_decode_encode_roundtrip() {
        // Every representable (sg, temp_f) pair survives the wire format.
        let adapter = TiltAdapter;
        for (major, minor) in [(32u16, 990u16), (68, 1045), (75, 1102)] {
            let reading = adapter.parse(&payload(tilt_frame(3, major, minor))).unwrap();
            let sg = reading.gravity_sg.unwrap();
            let temp_f = reading.temperature_c.unwrap() * 9.0 / 5.0 + 32.0;
            assert_eq!((sg * 1000.0).round() as u16, minor);
            assert_eq!(temp_f.round() as u16, major);
        }
    }

    #[test]
    fn test_parse_short_payload() {
        let adapter = TiltAdapter;
        let result = adapter.parse(&payload(vec![0x02, 0x15, 0xa4]));
        assert!(matches!(result, Err(AdapterError::Malformed { .. })));
    }
}
