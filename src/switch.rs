//! External switch-service client.
//!
//! The temperature controller drives heater and cooler entities through a
//! Home-Assistant-style REST contract: `GET /states/<entity>` reads the
//! current state, `POST /services/switch/turn_{on,off}` commands it.
//! Failures are transient by policy; the controller retries next tick.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};

/// Per-request timeout for the switch service.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Commanded or reported state of a switch entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchState {
    /// The entity is on.
    On,
    /// The entity is off.
    Off,
    /// The entity's state has not been read, or the service reported it
    /// unavailable.
    Unknown,
}

impl SwitchState {
    /// Parse the service's reported state string.
    pub fn from_report(value: &str) -> Self {
        match value {
            "on" => Self::On,
            "off" => Self::Off,
            _ => Self::Unknown,
        }
    }

    /// The wire string for commands and the hub stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abstraction over the external switch service.
///
/// The controller only depends on this trait, so control logic is testable
/// without a network.
#[async_trait]
pub trait SwitchService: Send + Sync {
    /// Read the current state of an entity.
    async fn get_state(&self, entity_id: &str) -> Result<SwitchState>;

    /// Command an entity on or off.
    async fn set_state(&self, entity_id: &str, on: bool) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct StateReport {
    state: String,
}

/// REST implementation of [`SwitchService`].
pub struct HaSwitchClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HaSwitchClient {
    /// Create a client for the given base URL and bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn unreachable(entity_id: &str, e: reqwest::Error) -> Error {
        Error::SwitchUnreachable {
            entity_id: entity_id.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl SwitchService for HaSwitchClient {
    async fn get_state(&self, entity_id: &str) -> Result<SwitchState> {
        let url = format!("{}/states/{entity_id}", self.base_url);
        let report: StateReport = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Self::unreachable(entity_id, e))?
            .error_for_status()
            .map_err(|e| Self::unreachable(entity_id, e))?
            .json()
            .await
            .map_err(|e| Self::unreachable(entity_id, e))?;
        Ok(SwitchState::from_report(&report.state))
    }

    async fn set_state(&self, entity_id: &str, on: bool) -> Result<()> {
        let service = if on { "turn_on" } else { "turn_off" };
        let url = format!("{}/services/switch/{service}", self.base_url);
        debug!(entity_id, service, "commanding switch");
        self.client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "entity_id": entity_id }))
            .send()
            .await
            .map_err(|e| Self::unreachable(entity_id, e))?
            .error_for_status()
            .map_err(|e| Self::unreachable(entity_id, e))?;
        Ok(())
    }
}

/// Read an ambient temperature sensor through the same states endpoint.
///
/// Returns `None` when the sensor is unavailable or non-numeric; the
/// caller treats a missing ambient as "unknown", never as an error.
pub async fn read_ambient(client: &HaSwitchClient, entity_id: &str) -> Option<f64> {
    let url = format!("{}/states/{entity_id}", client.base_url);
    let report: StateReport = client
        .client
        .get(&url)
        .bearer_auth(&client.token)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;
    report.state.parse().ok()
}
