//! Error types for the brewsignal crate.

use thiserror::Error;

/// Why an adapter refused a payload.
///
/// Adapters never retry: the source re-broadcasts, so a failed parse is
/// logged and dropped by the ingest manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The payload did not match the adapter's wire format.
    #[error("malformed payload: {context}")]
    Malformed {
        /// Description of what was wrong with the payload.
        context: String,
    },

    /// The payload declared a format version this adapter does not speak.
    #[error("unsupported payload version: {version}")]
    UnsupportedVersion {
        /// The version that was encountered.
        version: u8,
    },

    /// A field the adapter requires was absent.
    #[error("missing required field: {field}")]
    MissingRequiredField {
        /// The name of the missing field.
        field: String,
    },
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// An adapter could not parse a payload.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// No adapter recognized the payload.
    #[error("no adapter matched payload from {source_hint}")]
    UnroutablePayload {
        /// Where the payload came from (protocol and address, for logs).
        source_hint: String,
    },

    /// The specified device is not known to the registry.
    #[error("device not found: {device_id}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        device_id: String,
    },

    /// The specified batch does not exist or is deleted.
    #[error("batch not found: {batch_id}")]
    BatchNotFound {
        /// The batch id that was searched for.
        batch_id: i64,
    },

    /// A calibration curve failed validation.
    #[error("invalid calibration curve: {reason}")]
    InvalidCalibration {
        /// Why the curve was rejected.
        reason: String,
    },

    /// A batch state transition would violate an invariant.
    #[error("invalid batch transition: {reason}")]
    InvalidBatchTransition {
        /// Why the transition was rejected.
        reason: String,
    },

    /// Database error from the persistence layer.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The external switch service could not be reached.
    #[error("switch service unreachable for entity {entity_id}: {reason}")]
    SwitchUnreachable {
        /// The entity the command was addressed to.
        entity_id: String,
        /// Description of the transport failure.
        reason: String,
    },

    /// HTTP client error talking to an external collaborator.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An invalid parameter was provided.
    #[error("invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_display() {
        let e = AdapterError::MissingRequiredField {
            field: "gravity".to_string(),
        };
        assert_eq!(e.to_string(), "missing required field: gravity");
    }

    #[test]
    fn test_adapter_error_converts() {
        let e: Error = AdapterError::Malformed {
            context: "short payload".to_string(),
        }
        .into();
        assert!(matches!(e, Error::Adapter(_)));
    }
}
