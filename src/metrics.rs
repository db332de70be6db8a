//! Prometheus metrics, a near-direct adaptation of the teacher's
//! `metrics.rs`: install the recorder once at startup, describe the
//! gauges/counters this crate actually emits, expose `/metrics` gated by
//! `ENABLE_METRICS`.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        metrics::describe_gauge!(
            "mux_active_connections",
            "Live upstream connections, per named multiplexer instance"
        );
        metrics::describe_counter!(
            "mux_connections_opened_total",
            "Upstream connections opened, per named multiplexer instance"
        );
        metrics::describe_counter!(
            "mux_connections_closed_total",
            "Upstream connections closed, per named multiplexer instance and reason"
        );
        metrics::describe_counter!(
            "mux_subscribers_attached_total",
            "Subscribers attached to a live connection, per named multiplexer instance"
        );
        metrics::describe_counter!(
            "token_refresh_total",
            "OAuth refresh attempts, per outcome"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus scrape endpoint.
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let body = handle.render();
    (StatusCode::OK, body)
}

/// Tracks per-request HTTP metrics; installed as a global `axum::middleware::from_fn` layer.
pub async fn track_request_metrics(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();

    metrics::counter!("http_requests_total", 1);
    metrics::histogram!("http_request_duration_seconds", duration.as_secs_f64());

    response
}

pub fn record_connection_opened(mux_name: &'static str) {
    metrics::counter!("mux_connections_opened_total", 1, "mux" => mux_name);
}

pub fn record_connection_closed(mux_name: &'static str, reason: &str) {
    metrics::counter!(
        "mux_connections_closed_total", 1,
        "mux" => mux_name, "reason" => reason.to_string()
    );
}

pub fn record_subscriber_attached(mux_name: &'static str) {
    metrics::counter!("mux_subscribers_attached_total", 1, "mux" => mux_name);
}

pub fn record_token_refresh(outcome: &'static str) {
    metrics::counter!("token_refresh_total", 1, "outcome" => outcome);
}
