//! Prometheus metrics for chat streams and agent sessions.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a chat stream starting.
pub fn record_stream_start() {
    metrics::gauge!("chat_streams_active").increment(1.0);
}

/// Record a chat stream ending with the given outcome.
pub fn record_stream_end(outcome: &str) {
    metrics::gauge!("chat_streams_active").decrement(1.0);
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("chat_streams_total", &labels).increment(1);
}

pub fn record_chunk() {
    metrics::counter!("chat_chunks_total").increment(1);
}

/// Record a failure of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("chat_errors_total", &labels).increment(1);
}

pub fn record_session_created() {
    metrics::counter!("agent_sessions_created_total").increment(1);
}

pub fn set_sessions_cached(count: usize) {
    metrics::gauge!("agent_sessions_cached").set(count as f64);
}
