//! Advertisement scanning.
//!
//! The scanner is a pure source: it demultiplexes advertisements by
//! manufacturer id, wraps the interesting ones in [`RawPayload`]s and hands
//! them to the adapter registry — no state, no filtering, no persistence.
//! Four variants exist behind one handle: live BLE, a mock generator, a
//! snapshot-file poller, and a remote-relay poller.

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::adapter::tilt::APPLE_COMPANY_ID;
use crate::adapter::rapt::{RAPT_METRICS_COMPANY_ID, RAPT_VERSION_COMPANY_ID};
use crate::adapter::{AdapterRegistry, PayloadBody, RawPayload, SourceProtocol};
use crate::config::{ConfigStore, ScannerMode};
use crate::error::{Error, Result};
use crate::ingest::IngestManager;

/// Backoff floor after a BLE failure.
const BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Backoff cap; the scanner keeps retrying forever at this pace.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Poll interval for the file and relay variants.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Emission interval for the mock variant.
const MOCK_INTERVAL: Duration = Duration::from_secs(15);

/// One advertisement in a snapshot file or relay response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Advertising device address.
    pub address: String,
    /// Bluetooth SIG company identifier.
    pub manufacturer_id: u16,
    /// Manufacturer payload, hex-encoded.
    pub data: String,
    /// Signal strength, if the legacy daemon recorded one.
    pub rssi: Option<i16>,
}

/// The advertisement source.
pub struct Scanner {
    registry: Arc<AdapterRegistry>,
    ingest: Arc<IngestManager>,
    config: Arc<ConfigStore>,
    is_running: Arc<RwLock<bool>>,
    task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Scanner {
    /// Wire a scanner to the registry and funnel. It stays idle until
    /// [`Scanner::start`].
    pub fn new(
        registry: Arc<AdapterRegistry>,
        ingest: Arc<IngestManager>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            registry,
            ingest,
            config,
            is_running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    /// Start the variant selected by the current configuration. Idempotent.
    pub fn start(&self) {
        if *self.is_running.read() {
            debug!("scanner already running, ignoring start request");
            return;
        }
        *self.is_running.write() = true;

        let mode = self.config.get().scanner_mode;
        info!(?mode, "starting scanner");

        let registry = self.registry.clone();
        let ingest = self.ingest.clone();
        let config = self.config.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            match mode {
                ScannerMode::Ble => run_ble(registry, ingest, is_running).await,
                ScannerMode::Mock => run_mock(registry, ingest, is_running).await,
                ScannerMode::File => run_file(registry, ingest, config, is_running).await,
                ScannerMode::Relay => run_relay(registry, ingest, config, is_running).await,
            }
            debug!("scanner task ended");
        });
        *self.task.write() = Some(handle);
    }

    /// Stop the running variant. Idempotent.
    pub async fn stop(&self) {
        if !*self.is_running.read() {
            return;
        }
        info!("stopping scanner");
        *self.is_running.write() = false;
        let handle = self.task.write().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Stop and start again; used when `scanner_mode` changes.
    pub async fn restart(&self) {
        self.stop().await;
        self.start();
    }

    /// Whether a variant is currently running.
    pub fn is_running(&self) -> bool {
        *self.is_running.read()
    }
}

/// Route one payload: unmatched advertisements are discarded silently,
/// parse failures are logged and dropped, persist failures on this path
/// are dropped (the source re-broadcasts).
async fn handle_payload(
    registry: &AdapterRegistry,
    ingest: &IngestManager,
    payload: RawPayload,
) {
    match registry.parse(&payload) {
        Ok(Some(normalized)) => {
            let device_id = normalized.device_id.clone();
            match ingest.ingest(normalized).await {
                Ok(outcome) => trace!(device_id, ?outcome, "scanner payload ingested"),
                Err(e) => warn!(device_id, "scanner payload dropped: {e}"),
            }
        }
        Ok(None) => trace!("advertisement matched no adapter, discarded"),
        Err(e) => info!("adapter rejected advertisement: {e}"),
    }
}

/// Company ids worth forwarding to the adapters at all.
fn interesting(company_id: u16) -> bool {
    matches!(
        company_id,
        APPLE_COMPANY_ID | RAPT_METRICS_COMPANY_ID | RAPT_VERSION_COMPANY_ID
    )
}

// ── Live BLE ─────────────────────────────────────────────────────────

async fn run_ble(
    registry: Arc<AdapterRegistry>,
    ingest: Arc<IngestManager>,
    is_running: Arc<RwLock<bool>>,
) {
    let mut backoff = BACKOFF_MIN;
    while *is_running.read() {
        match scan_session(&registry, &ingest, &is_running).await {
            Ok(()) => break, // clean stop
            Err(e) => {
                error!("BLE scan failed: {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

/// One scan attempt: runs until stop or a BLE error.
async fn scan_session(
    registry: &AdapterRegistry,
    ingest: &IngestManager,
    is_running: &RwLock<bool>,
) -> Result<()> {
    let manager = Manager::new()
        .await
        .map_err(|_e| Error::BluetoothUnavailable)?;
    let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or(Error::BluetoothUnavailable)?;
    info!(
        "using Bluetooth adapter: {:?}",
        adapter.adapter_info().await.ok()
    );

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(Error::Bluetooth)?;

    let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
    while *is_running.read() {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(event) => handle_central_event(event, &adapter, registry, ingest).await,
                    None => {
                        let _ = adapter.stop_scan().await;
                        return Err(Error::BluetoothUnavailable);
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                // Re-check the running flag.
            }
        }
    }
    let _ = adapter.stop_scan().await;
    Ok(())
}

async fn handle_central_event(
    event: btleplug::api::CentralEvent,
    adapter: &Adapter,
    registry: &AdapterRegistry,
    ingest: &IngestManager,
) {
    use btleplug::api::CentralEvent;

    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
            process_peripheral(adapter, id, registry, ingest).await;
        }
        _ => {}
    }
}

/// Read a peripheral's advertisement properties and forward any
/// interesting manufacturer payloads, tagged with the radio's RSSI.
async fn process_peripheral(
    adapter: &Adapter,
    id: btleplug::platform::PeripheralId,
    registry: &AdapterRegistry,
    ingest: &IngestManager,
) {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("failed to get peripheral: {e}");
            return;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        _ => return,
    };

    let address = properties.address.to_string();
    for (company_id, data) in &properties.manufacturer_data {
        if !interesting(*company_id) {
            continue;
        }
        let payload = RawPayload {
            body: PayloadBody::Manufacturer {
                address: address.clone(),
                company_id: *company_id,
                data: Bytes::copy_from_slice(data),
            },
            source: SourceProtocol::Ble,
            rssi: properties.rssi,
            observed_at: Utc::now(),
        };
        handle_payload(registry, ingest, payload).await;
    }
}

// ── Mock ─────────────────────────────────────────────────────────────

/// Synthetic Tilt advertisements: a black Tilt slowly fermenting.
async fn run_mock(
    registry: Arc<AdapterRegistry>,
    ingest: Arc<IngestManager>,
    is_running: Arc<RwLock<bool>>,
) {
    let mut ticker = tokio::time::interval(MOCK_INTERVAL);
    let mut sample: u32 = 0;
    while *is_running.read() {
        ticker.tick().await;
        let gravity_x1000 = 1060_u16.saturating_sub((sample / 20) as u16).max(1008);
        let temp_f = 67 + (sample % 3) as u16;
        sample += 1;

        let payload = RawPayload {
            body: PayloadBody::Manufacturer {
                address: "00:00:00:00:00:00".to_string(),
                company_id: APPLE_COMPANY_ID,
                data: Bytes::from(mock_tilt_frame(3, temp_f, gravity_x1000)),
            },
            source: SourceProtocol::Mock,
            rssi: Some(-50),
            observed_at: Utc::now(),
        };
        handle_payload(&registry, &ingest, payload).await;
    }
}

/// Build a Tilt iBeacon manufacturer payload for the mock scanner.
fn mock_tilt_frame(color: u8, major: u16, minor: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(23);
    data.extend_from_slice(&[0x02, 0x15]);
    data.extend_from_slice(&[0xa4, 0x95, 0xbb, color << 4]);
    data.extend_from_slice(&[
        0xc5, 0xb1, 0x4b, 0x44, 0xb5, 0x12, 0x13, 0x70, 0xf0, 0x2d, 0x74, 0xde,
    ]);
    data.extend_from_slice(&major.to_be_bytes());
    data.extend_from_slice(&minor.to_be_bytes());
    data.push(0x00);
    data
}

// ── File ─────────────────────────────────────────────────────────────

/// Poll JSON snapshot files written by a legacy daemon. Duplicate
/// re-reads are harmless: the ingest throttle drops them.
async fn run_file(
    registry: Arc<AdapterRegistry>,
    ingest: Arc<IngestManager>,
    config: Arc<ConfigStore>,
    is_running: Arc<RwLock<bool>>,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    while *is_running.read() {
        ticker.tick().await;
        let Some(dir) = config.get().scanner_files_path else {
            warn!("file scanner selected but scanner_files_path is unset");
            continue;
        };
        let entries = match load_snapshot_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir, "snapshot directory unreadable: {e}");
                continue;
            }
        };
        forward_snapshot(&registry, &ingest, entries, SourceProtocol::File).await;
    }
}

async fn load_snapshot_dir(dir: &str) -> std::io::Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<Vec<SnapshotEntry>>(&text) {
            Ok(mut parsed) => entries.append(&mut parsed),
            Err(e) => warn!(path = %path.display(), "skipping malformed snapshot: {e}"),
        }
    }
    Ok(entries)
}

// ── Relay ────────────────────────────────────────────────────────────

/// HTTP-poll a remote host's snapshot endpoint.
async fn run_relay(
    registry: Arc<AdapterRegistry>,
    ingest: Arc<IngestManager>,
    config: Arc<ConfigStore>,
    is_running: Arc<RwLock<bool>>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("relay scanner could not build HTTP client: {e}");
            return;
        }
    };
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    while *is_running.read() {
        ticker.tick().await;
        let Some(host) = config.get().scanner_relay_host else {
            warn!("relay scanner selected but scanner_relay_host is unset");
            continue;
        };
        let url = format!("http://{host}/api/scanner/snapshot");
        let entries: Vec<SnapshotEntry> = match client.get(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.json().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(url, "relay snapshot undecodable: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(url, "relay returned error status: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!(url, "relay unreachable: {e}");
                continue;
            }
        };
        forward_snapshot(&registry, &ingest, entries, SourceProtocol::Relay).await;
    }
}

async fn forward_snapshot(
    registry: &AdapterRegistry,
    ingest: &IngestManager,
    entries: Vec<SnapshotEntry>,
    source: SourceProtocol,
) {
    for entry in entries {
        let data = match hex::decode(&entry.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(address = entry.address, "snapshot entry not hex: {e}");
                continue;
            }
        };
        let payload = RawPayload {
            body: PayloadBody::Manufacturer {
                address: entry.address,
                company_id: entry.manufacturer_id,
                data: Bytes::from(data),
            },
            source,
            rssi: entry.rssi,
            observed_at: Utc::now(),
        };
        handle_payload(registry, ingest, payload).await;
    }
}
