//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: raw frames received per upstream session, by decode path
//! - **Events**: events published, decode failures
//! - **Delivery**: queue drops and overflow disconnects
//! - **Connections**: downstream clients, upstream session states
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns [`BuildError`] if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "kucoin_relay_frames_received_total",
        "Raw frames received from upstream sessions"
    );
    describe_counter!(
        "kucoin_relay_events_published_total",
        "Decoded events published to the broadcast pool"
    );
    describe_counter!(
        "kucoin_relay_decode_errors_total",
        "Frames dropped because they failed to decode"
    );
    describe_counter!(
        "kucoin_relay_messages_dropped_total",
        "Queued messages discarded for slow downstream clients"
    );
    describe_counter!(
        "kucoin_relay_overflow_disconnects_total",
        "Downstream clients disconnected because their queue overflowed"
    );
    describe_counter!(
        "kucoin_relay_reconnects_total",
        "Upstream session reconnection attempts"
    );
    describe_gauge!(
        "kucoin_relay_downstream_clients",
        "Connected downstream WebSocket clients"
    );
    describe_gauge!(
        "kucoin_relay_upstream_sessions",
        "Upstream sessions currently connected"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a raw frame on the given decode path.
pub fn record_frame_received(path: &'static str) {
    counter!("kucoin_relay_frames_received_total", "path" => path).increment(1);
}

/// Record a published event.
pub fn record_event_published(kind: &'static str) {
    counter!("kucoin_relay_events_published_total", "kind" => kind).increment(1);
}

/// Record a decode failure.
pub fn record_decode_error(reason: &'static str) {
    counter!("kucoin_relay_decode_errors_total", "reason" => reason).increment(1);
}

/// Record delivery-side losses from one publish.
pub fn record_delivery_losses(dropped: usize, disconnected: usize) {
    if dropped > 0 {
        counter!("kucoin_relay_messages_dropped_total").increment(dropped as u64);
    }
    if disconnected > 0 {
        counter!("kucoin_relay_overflow_disconnects_total").increment(disconnected as u64);
    }
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(session: &str) {
    counter!("kucoin_relay_reconnects_total", "session" => session.to_string()).increment(1);
}

/// Set the downstream client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_downstream_clients(count: usize) {
    gauge!("kucoin_relay_downstream_clients").set(count as f64);
}

/// Adjust the connected upstream session count.
pub fn adjust_upstream_sessions(delta: f64) {
    gauge!("kucoin_relay_upstream_sessions").increment(delta);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received("ticker");
        record_event_published("kline");
        record_decode_error("malformed");
        record_delivery_losses(1, 1);
        record_reconnect("ticker");
        set_downstream_clients(3);
        adjust_upstream_sessions(1.0);
    }
}
