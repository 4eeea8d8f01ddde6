use crate::docker::RuntimeError;
use crate::metrics::Metrics;
use crate::model::{OwnerId, TargetId, TargetKind};
use crate::network::NetworkTools;
use crate::orchestrator::{EngineError, Orchestrator};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, warn};

pub const OWNER_HEADER: &str = "x-owner-id";
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub engine: Arc<Orchestrator>,
    pub network: Arc<NetworkTools>,
    pub push_interval: Duration,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    engine: Arc<Orchestrator>,
    network: Arc<NetworkTools>,
    push_interval: Duration,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/ping", get(ping_device))
        .route("/api/devices/:id/wake", post(wake_device))
        .route("/api/services", get(list_services))
        .route("/api/services/:id/health", get(service_health))
        .route("/api/metrics", get(current_metrics))
        .route("/api/metrics/history", get(metrics_history))
        .route("/api/metrics/cpu", get(cpu_metrics))
        .route("/api/metrics/memory", get(memory_metrics))
        .route("/api/metrics/disk", get(disk_metrics))
        .route("/api/metrics/network", get(network_metrics))
        .route("/ws/metrics", get(metrics_ws))
        .route("/api/containers", get(list_containers))
        .route("/api/containers/:id", get(inspect_container))
        .route("/api/containers/:id/start", post(start_container))
        .route("/api/containers/:id/stop", post(stop_container))
        .route("/api/containers/:id/restart", post(restart_container))
        .route("/api/network/ping", get(network_ping))
        .route("/api/network/speedtest", get(network_speedtest))
        .with_state(HttpAppState {
            metrics,
            engine,
            network,
            push_interval,
        })
}

#[derive(Debug)]
pub enum ApiError {
    MissingOwner,
    Engine(EngineError),
    Speedtest(reqwest::Error),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingOwner => StatusCode::BAD_REQUEST,
            Self::Speedtest(_) => StatusCode::BAD_GATEWAY,
            Self::Engine(err) => match err {
                EngineError::TargetNotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::InvalidAddress { .. }
                | EngineError::MissingMac(_)
                | EngineError::InvalidMac(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::Runtime(RuntimeError::NotFound(_)) => StatusCode::NOT_FOUND,
                EngineError::Runtime(RuntimeError::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Runtime(RuntimeError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::MissingOwner => format!("missing or invalid {OWNER_HEADER} header"),
            Self::Engine(err) => err.to_string(),
            Self::Speedtest(err) => format!("speed test failed: {err}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(%status, error = %message, "request failed");
        } else {
            warn!(%status, error = %message, "request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn owner(headers: &HeaderMap) -> Result<OwnerId, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or(ApiError::MissingOwner)
}

#[derive(Debug, Default, Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn list_targets(
    state: &HttpAppState,
    headers: &HeaderMap,
    kind: TargetKind,
    refresh: bool,
) -> Result<Response, ApiError> {
    let owner = owner(headers)?;
    let reports = if refresh {
        state.engine.targets_live(owner, kind).await?
    } else {
        state.engine.targets_fast(owner, kind).await?
    };
    Ok(Json(reports).into_response())
}

async fn list_devices(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    Query(q): Query<RefreshQuery>,
) -> Result<Response, ApiError> {
    list_targets(&state, &headers, TargetKind::Device, q.refresh).await
}

async fn list_services(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    Query(q): Query<RefreshQuery>,
) -> Result<Response, ApiError> {
    list_targets(&state, &headers, TargetKind::Service, q.refresh).await
}

async fn ping_device(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    Path(id): Path<TargetId>,
) -> Result<Response, ApiError> {
    let report = state
        .engine
        .target_live(owner(&headers)?, TargetKind::Device, id)
        .await?;
    Ok(Json(report).into_response())
}

async fn service_health(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    Path(id): Path<TargetId>,
) -> Result<Response, ApiError> {
    let report = state
        .engine
        .target_live(owner(&headers)?, TargetKind::Service, id)
        .await?;
    Ok(Json(report).into_response())
}

async fn wake_device(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    Path(id): Path<TargetId>,
) -> Result<Response, ApiError> {
    state.engine.wake_device(owner(&headers)?, id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "sent": true }))).into_response())
}

async fn current_metrics(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let sample = state.engine.current_sample().await?;
    Ok(Json(sample).into_response())
}

async fn cpu_metrics(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let sample = state.engine.current_sample().await?;
    Ok(Json(sample.cpu).into_response())
}

async fn memory_metrics(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let sample = state.engine.current_sample().await?;
    Ok(Json(sample.memory).into_response())
}

async fn disk_metrics(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let sample = state.engine.current_sample().await?;
    Ok(Json(sample.disks).into_response())
}

async fn network_metrics(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let sample = state.engine.current_sample().await?;
    Ok(Json(sample.network).into_response())
}

async fn metrics_ws(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    ws.on_upgrade(move |socket: WebSocket| {
        let (sink, incoming) = socket.split();
        stream_metrics(sink, incoming, state.engine, state.push_interval)
    })
}

/// Pushes a full sample every `period` until the client closes or a send
/// fails. Inbound frames other than close are ignored.
async fn stream_metrics<S, R>(
    mut sink: S,
    mut incoming: R,
    engine: Arc<Orchestrator>,
    period: Duration,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = ticker.tick() => {
                let sample = match engine.current_sample().await {
                    Ok(sample) => sample,
                    Err(err) => {
                        warn!(error = %err, "metrics push sample failed");
                        continue;
                    }
                };
                let text = match serde_json::to_string(&sample) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "metrics push encode failed");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("metrics stream closed");
}

async fn metrics_history(
    State(state): State<HttpAppState>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.engine.history(limit).await)
}

async fn list_containers(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.engine.containers().await)
}

async fn inspect_container(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let container = state.engine.container(&id).await?;
    Ok(Json(container).into_response())
}

async fn start_container(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.start_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_container(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.stop_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_container(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.restart_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn network_ping(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.network.latency().await)
}

async fn network_speedtest(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let report = state
        .network
        .speed_test()
        .await
        .map_err(ApiError::Speedtest)?;
    Ok(Json(report).into_response())
}
