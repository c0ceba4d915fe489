//! Axum router: WebSocket endpoint plus health, heap listing and metrics.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use heapcast_core::ids::HeapUri;
use heapcast_core::protocol::ProtocolVersion;
use heapcast_settings::HeapcastSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::connection::handle_ws_connection;
use crate::catalog::HeapCatalog;
use crate::push::{ConnectedObjectManager, HeapStats};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The push engine.
    pub manager: Arc<ConnectedObjectManager>,
    /// Heaps this node publishes.
    pub catalog: Arc<HeapCatalog>,
    /// Effective settings.
    pub settings: Arc<HeapcastSettings>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// State with no metrics recorder.
    pub fn new(
        manager: Arc<ConnectedObjectManager>,
        catalog: Arc<HeapCatalog>,
        settings: Arc<HeapcastSettings>,
    ) -> Self {
        Self {
            manager,
            catalog,
            settings,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Attach a Prometheus handle for `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/heaps", get(heaps_handler))
        .route("/heaps/stats", get(heap_stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve `state` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "heapcast server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Pick the wire version for a new connection.
pub fn negotiate_version(requested: Option<u8>, default: u8) -> Option<ProtocolVersion> {
    ProtocolVersion::from_number(requested.unwrap_or(default))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    protocol: Option<u8>,
}

/// GET /ws?protocol=N
async fn ws_handler(
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let default = state.settings.server.default_protocol_version;
    let Some(version) = negotiate_version(params.protocol, default) else {
        warn!(requested = ?params.protocol, "unsupported protocol version");
        return (StatusCode::BAD_REQUEST, "unsupported protocol version").into_response();
    };
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, version))
}

/// Health check response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while serving.
    pub status: String,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Live heaps with subscribers.
    pub live_heaps: usize,
    /// Heaps offered by the catalog.
    pub published_heaps: usize,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        live_heaps: state.manager.heap_count(),
        published_heaps: state.catalog.uris().len(),
    })
}

/// GET /heaps
async fn heaps_handler(State(state): State<AppState>) -> Json<Vec<HeapStats>> {
    Json(state.manager.list_heaps())
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    uri: HeapUri,
}

/// GET /heaps/stats?uri=...
async fn heap_stats_handler(
    Query(params): Query<StatsParams>,
    State(state): State<AppState>,
) -> Response {
    match state.manager.heap_stats(&params.uri) {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
