//! brewsignald — the BrewSignal service binary.
//!
//! Wires the store, configuration, pipeline, ingest funnel, scanner,
//! controller and HTTP server together, then runs until SIGINT. On
//! shutdown the HTTP server stops accepting, the scanner stops, the
//! controller sends every actuator to the safe-stop state, and the store
//! flushes and closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brewsignal::adapter::AdapterRegistry;
use brewsignal::ble::Scanner;
use brewsignal::config::ConfigStore;
use brewsignal::controller::TempController;
use brewsignal::hub::BroadcastHub;
use brewsignal::ingest::IngestManager;
use brewsignal::pipeline::ProcessorPool;
use brewsignal::server::{self, AppState};
use brewsignal::store::Database;
use brewsignal::switch::{self, HaSwitchClient};

/// How often the retention sweeper runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often the ambient sensor is polled.
const AMBIENT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let db_path = std::env::var("BREWSIGNAL_DB").unwrap_or_else(|_| "brewsignal.db".to_string());
    let listen: SocketAddr = std::env::var("BREWSIGNAL_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()
        .context("BREWSIGNAL_LISTEN is not a socket address")?;

    info!("brewsignal starting, database at {db_path}");
    let db = Arc::new(
        Database::new(&db_path)
            .await
            .context("failed to open database")?,
    );
    let config = Arc::new(
        ConfigStore::load(db.clone())
            .await
            .context("failed to load configuration")?,
    );

    let hub = Arc::new(BroadcastHub::new());
    let pipeline = Arc::new(ProcessorPool::new(db.clone()));
    let ingest = Arc::new(IngestManager::new(
        db.clone(),
        pipeline.clone(),
        hub.clone(),
        config.clone(),
    ));
    let registry = Arc::new(AdapterRegistry::new());

    let settings = config.get();
    let switch_client = Arc::new(
        HaSwitchClient::new(&settings.ha_url, &settings.ha_token)
            .context("failed to build switch-service client")?,
    );
    let controller = Arc::new(TempController::new(
        db.clone(),
        switch_client.clone(),
        hub.clone(),
        config.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Controller tick loop.
    tokio::spawn(controller.clone().run(shutdown_tx.subscribe()));

    // Scanner, restarted whenever the configured mode changes.
    let scanner = Arc::new(Scanner::new(registry.clone(), ingest.clone(), config.clone()));
    scanner.start();
    tokio::spawn(watch_scanner_mode(
        scanner.clone(),
        config.clone(),
        shutdown_tx.subscribe(),
    ));

    // Ambient poller and retention sweeper.
    tokio::spawn(poll_ambient(
        switch_client,
        config.clone(),
        hub.clone(),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(sweep_retention(
        db.clone(),
        config.clone(),
        shutdown_tx.subscribe(),
    ));

    // HTTP server, gracefully shut down by the same signal.
    let state = AppState {
        db: db.clone(),
        ingest,
        registry,
        hub,
        config,
        controller,
        pipeline,
    };
    let mut server_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(server::serve(state, listen, async move {
        let _ = server_shutdown.recv().await;
    }));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(());

    scanner.stop().await;
    // The controller's run() drains the shutdown signal and issues
    // safe-stop before returning; give it a moment to finish.
    if let Ok(result) = tokio::time::timeout(Duration::from_secs(10), server).await {
        if let Ok(Err(e)) = result {
            warn!("http server exited with error: {e}");
        }
    }
    db.close().await;
    info!("brewsignal stopped");
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "brewsignal=info,brewsignald=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Restart the scanner when `scanner_mode` changes.
async fn watch_scanner_mode(
    scanner: Arc<Scanner>,
    config: Arc<ConfigStore>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut rx = config.subscribe();
    let mut mode = config.get().scanner_mode;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let new_mode = rx.borrow().scanner_mode;
                if new_mode != mode {
                    info!(?mode, ?new_mode, "scanner mode changed, restarting scanner");
                    mode = new_mode;
                    scanner.restart().await;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Poll the configured ambient sensor and publish samples to the hub.
async fn poll_ambient(
    client: Arc<HaSwitchClient>,
    config: Arc<ConfigStore>,
    hub: Arc<BroadcastHub>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(AMBIENT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let settings = config.get();
                if !settings.ha_enabled {
                    continue;
                }
                let Some(entity) = settings.ha_ambient_entity_id else {
                    continue;
                };
                match switch::read_ambient(&client, &entity).await {
                    Some(temperature_c) => {
                        hub.publish_ambient(temperature_c, chrono::Utc::now());
                    }
                    None => warn!(entity, "ambient sensor unreadable, skipping sample"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Delete readings past the configured retention and reclaim readings
/// still linked to soft-deleted batches.
async fn sweep_retention(
    db: Arc<Database>,
    config: Arc<ConfigStore>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let days = config.get().cleanup_retention_days;
                if days > 0 {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
                    match db.delete_readings_older_than(cutoff).await {
                        Ok(count) if count > 0 => info!(count, days, "retention sweep removed readings"),
                        Ok(_) => {}
                        Err(e) => warn!("retention sweep failed: {e}"),
                    }
                }
                match reclaim_orphans(&db).await {
                    Ok(count) if count > 0 => info!(count, "reclaimed readings from deleted batches"),
                    Ok(_) => {}
                    Err(e) => warn!("orphan sweep failed: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Delete readings whose batch has been soft-deleted.
async fn reclaim_orphans(db: &Database) -> brewsignal::Result<u64> {
    let deleted = db.deleted_batch_ids().await?;
    if deleted.is_empty() {
        return Ok(0);
    }
    let orphans = db.orphaned_readings().await?;
    if orphans.is_empty() {
        return Ok(0);
    }
    db.delete_readings_by_batch(&deleted).await
}
