//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Live published objects (gauge).
pub const PUSH_HEAPS_ACTIVE: &str = "push_heaps_active";
/// Subscriptions opened (counter).
pub const PUSH_SUBSCRIPTIONS_OPENED_TOTAL: &str = "push_subscriptions_opened_total";
/// Subscriptions closed (counter, labels: reason).
pub const PUSH_SUBSCRIPTIONS_CLOSED_TOTAL: &str = "push_subscriptions_closed_total";
/// Subscribe requests rejected (counter, labels: code).
pub const PUSH_SUBSCRIBE_REJECTED_TOTAL: &str = "push_subscribe_rejected_total";
/// Delta batches delivered (counter).
pub const PUSH_BATCHES_TOTAL: &str = "push_batches_total";
/// Frames handed to sessions (counter).
pub const PUSH_FRAMES_TOTAL: &str = "push_frames_total";
/// Frames encoded (counter, labels: version).
pub const PUSH_ENCODES_TOTAL: &str = "push_encodes_total";
/// Failed session writes (counter).
pub const PUSH_WRITE_FAILURES_TOTAL: &str = "push_write_failures_total";
/// Flushes that ended in an internal error (counter).
pub const PUSH_FLUSH_ERRORS_TOTAL: &str = "push_flush_errors_total";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
