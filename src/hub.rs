//! Latest-reading fan-out.
//!
//! The hub multiplexes processed-reading snapshots (plus ambient and
//! actuator-state changes) to WebSocket subscribers over a broadcast
//! channel. Sends never block the producer: a subscriber that falls behind
//! loses its oldest queued messages, not the stream.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered messages per subscriber before the oldest are dropped.
const SUBSCRIBER_BUFFER: usize = 64;

/// The stable per-reading snapshot shape pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingSnapshot {
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
    pub is_anomaly: bool,
}

/// A message on the hub stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// One accepted reading.
    Reading(ReadingSnapshot),
    /// Latest ambient temperature, °C.
    Ambient {
        temperature_c: f64,
        at: DateTime<Utc>,
    },
    /// An actuator changed commanded state.
    ActuatorState {
        batch_id: i64,
        entity_id: String,
        state: String,
        at: DateTime<Utc>,
    },
}

/// Fan-out hub with a latest-per-device cache for late joiners.
pub struct BroadcastHub {
    tx: broadcast::Sender<HubMessage>,
    latest: RwLock<HashMap<String, ReadingSnapshot>>,
    ambient: RwLock<Option<(f64, DateTime<Utc>)>>,
}

impl BroadcastHub {
    /// Create an idle hub.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            tx,
            latest: RwLock::new(HashMap::new()),
            ambient: RwLock::new(None),
        }
    }

    /// Subscribe, receiving the consolidated latest-reading snapshot first.
    ///
    /// The snapshot lets a new client sync immediately; the receiver then
    /// yields live messages.
    pub fn subscribe(&self) -> (Vec<HubMessage>, broadcast::Receiver<HubMessage>) {
        // Take the receiver before copying the snapshot so a message
        // published in between is duplicated rather than lost.
        let rx = self.tx.subscribe();
        let mut backlog: Vec<HubMessage> = self
            .latest
            .read()
            .values()
            .cloned()
            .map(HubMessage::Reading)
            .collect();
        if let Some((temperature_c, at)) = *self.ambient.read() {
            backlog.push(HubMessage::Ambient { temperature_c, at });
        }
        (backlog, rx)
    }

    /// Publish an accepted reading.
    pub fn publish_reading(&self, snapshot: ReadingSnapshot) {
        self.latest
            .write()
            .insert(snapshot.device_id.clone(), snapshot.clone());
        // Send fails only when no subscriber is connected.
        let _ = self.tx.send(HubMessage::Reading(snapshot));
    }

    /// Publish an ambient temperature sample.
    pub fn publish_ambient(&self, temperature_c: f64, at: DateTime<Utc>) {
        *self.ambient.write() = Some((temperature_c, at));
        let _ = self.tx.send(HubMessage::Ambient { temperature_c, at });
    }

    /// Publish an actuator state change.
    pub fn publish_actuator_state(
        &self,
        batch_id: i64,
        entity_id: &str,
        state: &str,
        at: DateTime<Utc>,
    ) {
        trace!(batch_id, entity_id, state, "actuator state published");
        let _ = self.tx.send(HubMessage::ActuatorState {
            batch_id,
            entity_id: entity_id.to_string(),
            state: state.to_string(),
            at,
        });
    }

    /// The cached latest reading for a device.
    pub fn latest_reading(&self, device_id: &str) -> Option<ReadingSnapshot> {
        self.latest.read().get(device_id).cloned()
    }

    /// The most recent ambient sample.
    pub fn latest_ambient(&self) -> Option<(f64, DateTime<Utc>)> {
        *self.ambient.read()
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
