//! Prometheus metrics endpoint, grounded on the teacher's
//! `metrics/router.rs`. The core servers here are hyper-direct rather than
//! `axum::Router`-based, so instrumentation happens by calling
//! [`record_http_request`] from the HTTP dispatch path instead of through an
//! `axum` middleware layer; the `/metrics` endpoint itself stays `axum`,
//! exactly as the teacher serves it on its own listener.

use std::future::ready;
use std::time::Duration;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Builds the `/metrics` router. Call once per process; the returned
/// recorder is installed globally on first call.
pub fn metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();
    Router::new().route("/metrics", get(move || ready(recorder_handle.render())))
}

fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Records one impersonation-server HTTP response: total count plus a
/// duration histogram, labeled by path and status (§4.5).
pub fn record_http_request(path: &str, status: u16, elapsed: Duration) {
    let labels = [
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(elapsed.as_secs_f64());
}

/// Records one granted DHCP lease, one resolved DNS query, or one OTA
/// milestone — the three other ambient lifecycle counters the Orchestrator
/// increments from Event Bus subscriptions.
pub fn record_event(kind: &str) {
    metrics::counter!("cloudcutter_events_total", &[("kind", kind.to_string())]).increment(1);
}
