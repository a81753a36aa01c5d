//! HTTP ingress, WebSocket stream and admin API.
//!
//! Trust-the-LAN surface: no authentication. Ingress endpoints return the
//! stable status-code set (`202` accepted, `200` throttled/unpaired/
//! rejected, `400` malformed); the WebSocket pushes a consolidated
//! snapshot on connect and one message per accepted reading after that.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::adapter::{
    Adapter, AdapterRegistry, GravityMonAdapter, IspindelAdapter, PayloadBody, RawPayload,
    SourceProtocol,
};
use crate::calibration::CalibrationCurve;
use crate::config::{ConfigStore, SettingsPatch};
use crate::controller::{ActuatorTarget, ControlOverride, TempController};
use crate::error::Error;
use crate::hub::{BroadcastHub, HubMessage};
use crate::ingest::{IngestManager, IngestOutcome};
use crate::pipeline::ProcessorPool;
use crate::predictor;
use crate::store::{BatchPatch, Database, Reading, EXPORT_PAGE_SIZE, MAX_QUERY_LIMIT};
use crate::switch::SwitchState;

/// Shared handles for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ingest: Arc<IngestManager>,
    pub registry: Arc<AdapterRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub config: Arc<ConfigStore>,
    pub controller: Arc<TempController>,
    pub pipeline: Arc<ProcessorPool>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::DeviceNotFound { .. } | Error::BatchNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Adapter(_)
            | Error::UnroutablePayload { .. }
            | Error::InvalidCalibration { .. }
            | Error::InvalidBatchTransition { .. }
            | Error::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest/generic", post(ingest_generic))
        .route("/api/ingest/ispindel", post(ingest_ispindel))
        .route("/api/ingest/gravitymon", post(ingest_gravitymon))
        .route("/ws", get(ws_upgrade))
        .route("/log.csv", get(export_csv))
        .route("/api/devices", get(list_devices))
        .route(
            "/api/devices/:id",
            axum::routing::patch(update_device),
        )
        .route(
            "/api/devices/:id/calibration",
            axum::routing::put(set_calibration),
        )
        .route("/api/devices/:id/reset", post(reset_device))
        .route("/api/readings/:device_id", get(device_readings))
        .route("/api/batches", get(list_batches).post(create_batch))
        .route(
            "/api/batches/:id",
            axum::routing::patch(update_batch).delete(delete_batch),
        )
        .route(
            "/api/batches/:id/override",
            post(set_override).delete(clear_override),
        )
        .route("/api/batches/:id/status", get(batch_status))
        .route("/api/batches/:id/prediction", get(batch_prediction))
        .route("/api/config", get(get_config).put(put_config))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown future resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("http server failed: {e}")))?;
    Ok(())
}

// ── Ingress ──────────────────────────────────────────────────────────

fn http_payload(body: serde_json::Value) -> RawPayload {
    RawPayload {
        body: PayloadBody::Json(body),
        source: SourceProtocol::Http,
        rssi: None,
        observed_at: Utc::now(),
    }
}

fn outcome_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::Accepted { reading_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "result": "accepted", "reading_id": reading_id })),
        )
            .into_response(),
        IngestOutcome::Throttled => {
            (StatusCode::OK, Json(json!({ "result": "throttled" }))).into_response()
        }
        IngestOutcome::DeviceUnpaired => (
            StatusCode::OK,
            Json(json!({ "result": "device_unpaired" })),
        )
            .into_response(),
        IngestOutcome::Rejected { reason } => (
            StatusCode::OK,
            Json(json!({ "result": "rejected", "reason": reason.as_str() })),
        )
            .into_response(),
    }
}

async fn ingest_generic(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, Error> {
    let payload = http_payload(body);
    let normalized = state
        .registry
        .parse(&payload)?
        .ok_or(Error::UnroutablePayload {
            source_hint: "http generic ingress".to_string(),
        })?;
    let outcome = state.ingest.ingest(normalized).await?;
    Ok(outcome_response(outcome))
}

async fn ingest_ispindel(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, Error> {
    let normalized = IspindelAdapter.parse(&http_payload(body))?;
    let outcome = state.ingest.ingest(normalized).await?;
    Ok(outcome_response(outcome))
}

async fn ingest_gravitymon(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, Error> {
    let normalized = GravityMonAdapter.parse(&http_payload(body))?;
    let outcome = state.ingest.ingest(normalized).await?;
    Ok(outcome_response(outcome))
}

// ── WebSocket ────────────────────────────────────────────────────────

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

async fn ws_session(state: AppState, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let client_id = uuid::Uuid::new_v4();
    let (backlog, mut rx) = state.hub.subscribe();
    info!(%client_id, backlog = backlog.len(), "websocket client connected");

    let (mut sink, mut stream) = socket.split();
    for message in backlog {
        if send_hub_message(&mut sink, &message).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Ok(message) => {
                        if send_hub_message(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // The oldest queued messages were dropped rather
                        // than blocking the producer.
                        debug!(%client_id, missed, "websocket client lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // the channel is one-way
                    Some(Err(_)) => break,
                }
            }
        }
    }
    info!(%client_id, "websocket client disconnected");
}

async fn send_hub_message(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    message: &HubMessage,
) -> Result<(), ()> {
    use futures::SinkExt;
    let text = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

// ── CSV export ───────────────────────────────────────────────────────

fn csv_line(reading: &Reading) -> String {
    fn opt(value: Option<f64>) -> String {
        value.map(|v| v.to_string()).unwrap_or_default()
    }
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
        reading.id,
        reading.device_id,
        reading.timestamp.to_rfc3339(),
        opt(reading.gravity_raw),
        opt(reading.gravity_calibrated),
        opt(reading.gravity_filtered),
        opt(reading.temperature_raw),
        opt(reading.temperature_calibrated),
        opt(reading.temperature_filtered),
        reading.rssi.map(|v| v.to_string()).unwrap_or_default(),
        reading.confidence,
        reading.is_anomaly,
        reading.batch_id.map(|v| v.to_string()).unwrap_or_default(),
        reading.status.as_str(),
    )
}

/// Stream the union of all readings, chronological (id order), in pages
/// that bound memory on the SBC.
async fn export_csv(State(state): State<AppState>) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, std::io::Error>>(4);
    let db = state.db.clone();
    tokio::spawn(async move {
        let header = "id,device_id,timestamp,gravity_raw,gravity_calibrated,\
                      gravity_filtered,temperature_raw,temperature_calibrated,\
                      temperature_filtered,rssi,confidence,is_anomaly,batch_id,status\n";
        if tx.send(Ok(header.to_string())).await.is_err() {
            return;
        }
        let mut after_id = 0;
        loop {
            let page = match db.readings_page(after_id, EXPORT_PAGE_SIZE).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("csv export aborted: {e}");
                    return;
                }
            };
            let Some(last) = page.last() else { break };
            after_id = last.id;
            let chunk: String = page.iter().map(csv_line).collect();
            if tx.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
    });

    let body = axum::body::Body::from_stream(ReceiverStream::new(rx));
    (
        [(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
        .into_response()
}

// ── Devices ──────────────────────────────────────────────────────────

async fn list_devices(State(state): State<AppState>) -> Result<Response, Error> {
    let devices = state.db.list_devices().await?;
    Ok(Json(devices).into_response())
}

#[derive(Debug, Deserialize)]
struct DevicePatch {
    name: Option<String>,
    paired: Option<bool>,
    native_gravity_unit: Option<String>,
    native_temperature_unit: Option<String>,
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<DevicePatch>,
) -> Result<Response, Error> {
    let device = state
        .db
        .update_device(
            &id,
            patch.name.as_deref(),
            patch.paired,
            patch.native_gravity_unit.as_deref(),
            patch.native_temperature_unit.as_deref(),
        )
        .await?;
    Ok(Json(device).into_response())
}

#[derive(Debug, Deserialize)]
struct CalibrationUpdate {
    /// Absent leaves the curve alone; `null` clears it.
    #[serde(default, with = "crate::store::double_option")]
    gravity: Option<Option<CalibrationCurve>>,
    #[serde(default, with = "crate::store::double_option")]
    temperature: Option<Option<CalibrationCurve>>,
}

async fn set_calibration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<CalibrationUpdate>,
) -> Result<Response, Error> {
    for curve in [&update.gravity, &update.temperature].into_iter().flatten().flatten() {
        curve.validate()?;
    }
    let gravity_json = update
        .gravity
        .as_ref()
        .map(|o| o.as_ref().map(CalibrationCurve::to_json));
    let temperature_json = update
        .temperature
        .as_ref()
        .map(|o| o.as_ref().map(CalibrationCurve::to_json));
    let device = state
        .db
        .set_calibration(
            &id,
            gravity_json.as_ref().map(|o| o.as_deref()),
            temperature_json.as_ref().map(|o| o.as_deref()),
        )
        .await?;
    // New calibration invalidates the filter history.
    state.pipeline.reset(&id);
    Ok(Json(device).into_response())
}

async fn reset_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    state
        .db
        .get_device(&id)
        .await?
        .ok_or(Error::DeviceNotFound { device_id: id.clone() })?;
    state.pipeline.reset(&id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Readings ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RangeQuery {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

async fn device_readings(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Response, Error> {
    let until = range.until.unwrap_or_else(Utc::now);
    let since = range.since.unwrap_or(until - Duration::days(7));
    let limit = range.limit.unwrap_or(MAX_QUERY_LIMIT);
    let readings = state
        .db
        .readings_in_range(&device_id, since, until, limit)
        .await?;
    Ok(Json(readings).into_response())
}

// ── Batches ──────────────────────────────────────────────────────────

async fn list_batches(State(state): State<AppState>) -> Result<Response, Error> {
    let batches = state.db.list_batches().await?;
    Ok(Json(batches).into_response())
}

#[derive(Debug, Deserialize)]
struct NewBatch {
    device_id: Option<String>,
    recipe_id: Option<i64>,
    batch_number: i64,
}

async fn create_batch(
    State(state): State<AppState>,
    Json(new): Json<NewBatch>,
) -> Result<Response, Error> {
    let batch = state
        .db
        .create_batch(new.device_id.as_deref(), new.recipe_id, new.batch_number)
        .await?;
    Ok((StatusCode::CREATED, Json(batch)).into_response())
}

async fn update_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<BatchPatch>,
) -> Result<Response, Error> {
    let batch = state.db.update_batch(id, &patch).await?;
    Ok(Json(batch).into_response())
}

async fn delete_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, Error> {
    state.db.delete_batch(id).await?;
    state.controller.clear_override(id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    target: String,
    state: String,
    duration_minutes: i64,
}

async fn set_override(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<OverrideRequest>,
) -> Result<Response, Error> {
    state
        .db
        .get_batch(id)
        .await?
        .ok_or(Error::BatchNotFound { batch_id: id })?;

    let target = match request.target.as_str() {
        "heater" => ActuatorTarget::Heater,
        "cooler" => ActuatorTarget::Cooler,
        other => {
            return Err(Error::InvalidParameter {
                name: "target".to_string(),
                value: other.to_string(),
            })
        }
    };
    let force_on = match request.state.as_str() {
        "on" => true,
        "off" => false,
        other => {
            return Err(Error::InvalidParameter {
                name: "state".to_string(),
                value: other.to_string(),
            })
        }
    };
    if request.duration_minutes <= 0 {
        return Err(Error::InvalidParameter {
            name: "duration_minutes".to_string(),
            value: request.duration_minutes.to_string(),
        });
    }

    state.controller.set_override(
        id,
        ControlOverride {
            target,
            force_on,
            expires_at: Utc::now() + Duration::minutes(request.duration_minutes),
        },
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn clear_override(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, Error> {
    state.controller.clear_override(id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Controller view of a batch: commanded actuator states and staleness.
async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, Error> {
    let batch = state
        .db
        .get_batch(id)
        .await?
        .ok_or(Error::BatchNotFound { batch_id: id })?;
    let (heater, cooler) = state.controller.actuator_states(id);

    let (latest_at, stale) = match &batch.device_id {
        Some(device_id) => match state.db.latest_valid_reading(device_id).await? {
            Some(reading) => (
                Some(reading.timestamp),
                Utc::now() - reading.timestamp > crate::controller::STALE_AFTER,
            ),
            None => (None, true),
        },
        None => (None, true),
    };

    Ok(Json(json!({
        "batch_id": id,
        "heater": heater.as_str(),
        "cooler": cooler.as_str(),
        "latest_reading_at": latest_at,
        "stale": stale,
        "override": state.controller.get_override(id).map(|o| json!({
            "target": match o.target {
                ActuatorTarget::Heater => "heater",
                ActuatorTarget::Cooler => "cooler",
            },
            "state": if o.force_on { SwitchState::On.as_str() } else { SwitchState::Off.as_str() },
            "expires_at": o.expires_at,
        })),
    }))
    .into_response())
}

async fn batch_prediction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, Error> {
    let batch = state
        .db
        .get_batch(id)
        .await?
        .ok_or(Error::BatchNotFound { batch_id: id })?;

    let history: Vec<(DateTime<Utc>, f64)> = state
        .db
        .recent_batch_readings(id, MAX_QUERY_LIMIT)
        .await?
        .into_iter()
        .filter(|r| !r.is_anomaly)
        .filter_map(|r| r.gravity_filtered.map(|g| (r.timestamp, g)))
        .collect();

    let target = batch
        .measured_fg
        .or_else(|| batch.measured_og.map(predictor::default_target_gravity));

    let estimate = target.and_then(|t| predictor::estimate_completion(&history, t));
    Ok(Json(json!({
        "batch_id": id,
        "target_gravity": target,
        "estimated_completion": estimate,
    }))
    .into_response())
}

// ── Config ───────────────────────────────────────────────────────────

async fn get_config(State(state): State<AppState>) -> Response {
    Json(state.config.get()).into_response()
}

async fn put_config(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Response, Error> {
    let settings = state.config.update(&patch).await?;
    Ok(Json(settings).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::mock::MockSwitch;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt as _;

    async fn app() -> (AppState, Router) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let config = Arc::new(ConfigStore::load(db.clone()).await.unwrap());
        config
            .update(&SettingsPatch {
                pairing_required: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        let pipeline = Arc::new(ProcessorPool::new(db.clone()));
        let hub = Arc::new(BroadcastHub::new());
        let ingest = Arc::new(IngestManager::new(
            db.clone(),
            pipeline.clone(),
            hub.clone(),
            config.clone(),
        ));
        let controller = Arc::new(TempController::new(
            db.clone(),
            Arc::new(MockSwitch::new()),
            hub.clone(),
            config.clone(),
        ));
        let state = AppState {
            db,
            ingest,
            registry: Arc::new(AdapterRegistry::new()),
            hub,
            config,
            controller,
            pipeline,
        };
        let router = router(state.clone());
        (state, router)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ispindel_ingest_returns_202() {
        let (_state, router) = app().await;
        let response = router
            .oneshot(post_json(
                "/api/ingest/ispindel",
                serde_json::json!({
                    "name": "Spindel1", "ID": 12345, "angle": 45.2,
                    "temperature": 20.0, "temp_units": "C",
                    "gravity": 1.048, "battery": 3.98, "RSSI": -62,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_malformed_ingest_returns_400() {
        let (_state, router) = app().await;
        let response = router
            .oneshot(post_json(
                "/api/ingest/ispindel",
                serde_json::json!({ "name": "s", "angle": 1.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generic_ingest_unroutable_returns_400() {
        let (_state, router) = app().await;
        let response = router
            .oneshot(post_json(
                "/api/ingest/generic",
                serde_json::json!({ "hello": "world" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_throttled_ingest_returns_200() {
        let (_state, router) = app().await;
        let body = serde_json::json!({
            "name": "Spindel1", "angle": 45.2, "temperature": 20.0,
            "gravity": 1.048,
        });
        let first = router
            .clone()
            .oneshot(post_json("/api/ingest/ispindel", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = router
            .oneshot(post_json("/api/ingest/ispindel", body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unpaired_gate_returns_200() {
        let (state, router) = app().await;
        state
            .config
            .update(&SettingsPatch {
                pairing_required: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let response = router
            .oneshot(post_json(
                "/api/ingest/ispindel",
                serde_json::json!({
                    "name": "Spindel1", "angle": 45.2, "temperature": 20.0,
                    "gravity": 1.048,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_device_admin_pairs() {
        let (state, router) = app().await;
        state
            .db
            .upsert_device("Spindel1", "ispindel", "SG", "C", Utc::now())
            .await
            .unwrap();
        let response = router
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri("/api/devices/Spindel1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"paired": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.db.get_device("Spindel1").await.unwrap().unwrap().paired);
    }

    #[tokio::test]
    async fn test_calibration_validation_rejects_bad_curve() {
        let (state, router) = app().await;
        state
            .db
            .upsert_device("Spindel1", "ispindel", "SG", "C", Utc::now())
            .await
            .unwrap();
        let response = router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/devices/Spindel1/calibration")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"gravity": {"type": "linear", "points": [[1.05, 1.05], [1.0, 1.0]]}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let (_state, router) = app().await;
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"min_rssi": -72}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::builder().uri("/api/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["min_rssi"], -72);
    }

    #[tokio::test]
    async fn test_override_validation() {
        let (state, router) = app().await;
        let batch = state.db.create_batch(None, None, 1).await.unwrap();
        let response = router
            .oneshot(post_json(
                &format!("/api/batches/{}/override", batch.id),
                serde_json::json!({
                    "target": "blender", "state": "on", "duration_minutes": 10,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_csv_export_has_header_and_rows() {
        let (_state, router) = app().await;
        // One accepted reading first.
        router
            .clone()
            .oneshot(post_json(
                "/api/ingest/ispindel",
                serde_json::json!({
                    "name": "Spindel1", "angle": 45.2, "temperature": 20.0,
                    "gravity": 1.048,
                }),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(Request::builder().uri("/log.csv").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("id,device_id,timestamp"));
        assert!(text.lines().count() >= 2);
        assert!(text.contains("Spindel1"));
    }
}
