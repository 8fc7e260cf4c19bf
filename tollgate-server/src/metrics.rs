//! Prometheus metrics for the gateway.
//!
//! Recording goes through the `metrics` facade, so every function here is a
//! no-op until [`GatewayMetrics::install`] registers the Prometheus recorder.
//! Route labels always use the route pattern, never the concrete path.

use axum::{extract::State, routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tollgate_core::error::ErrorCode;
use tollgate_core::routes::Backend;

use crate::circuit_breaker::CircuitState;

/// Handle to the installed Prometheus recorder.
pub struct GatewayMetrics {
    handle: PrometheusHandle,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Prefix("tollgate_request_duration".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )?
            .set_buckets_for_metric(
                Matcher::Prefix("tollgate_upstream_duration".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )?
            .install_recorder()?;

        Ok(Self { handle })
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a completed request.
pub fn record_request(route: &str, backend: Option<Backend>, status: u16, duration_secs: f64) {
    let status_class = format!("{}xx", status / 100);
    let backend = backend.map(|b| b.as_str()).unwrap_or("none");

    counter!("tollgate_requests_total",
        "route" => route.to_string(),
        "backend" => backend,
        "status_class" => status_class
    )
    .increment(1);

    histogram!("tollgate_request_duration_seconds",
        "route" => route.to_string(),
        "backend" => backend
    )
    .record(duration_secs);
}

/// Record a rejection the gateway produced itself.
pub fn record_rejection(code: ErrorCode) {
    counter!("tollgate_rejections_total", "code" => code.as_str()).increment(1);
}

/// Record a rate limit rejection.
pub fn record_rate_limited(client_kind: &'static str) {
    counter!("tollgate_rate_limited_total", "client" => client_kind).increment(1);
}

/// Record an IP block being set or a request refused by one.
pub fn record_ip_blocked(reason: &'static str) {
    counter!("tollgate_ip_blocked_total", "reason" => reason).increment(1);
}

/// Record a KV failure that was absorbed by failing open.
pub fn record_kv_degraded(component: &'static str) {
    counter!("tollgate_kv_degraded_total", "component" => component).increment(1);
}

/// Record a breaker transition into Open.
pub fn record_circuit_trip(backend: Backend) {
    counter!("tollgate_circuit_trips_total", "backend" => backend.as_str()).increment(1);
}

/// Current breaker state: 0 closed, 1 half-open, 2 open.
pub fn set_circuit_state(backend: Backend, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("tollgate_circuit_state", "backend" => backend.as_str()).set(value);
}

/// Record an upstream call.
pub fn record_upstream(backend: Backend, status: u16, duration_secs: f64) {
    let status_class = format!("{}xx", status / 100);
    counter!("tollgate_upstream_requests_total",
        "backend" => backend.as_str(),
        "status_class" => status_class
    )
    .increment(1);
    histogram!("tollgate_upstream_duration_seconds", "backend" => backend.as_str())
        .record(duration_secs);
}

/// Record an upstream transport failure.
pub fn record_upstream_error(backend: Backend, error_type: &'static str) {
    counter!("tollgate_upstream_errors_total",
        "backend" => backend.as_str(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Record server startup.
pub fn record_server_start() {
    counter!("tollgate_server_starts_total").increment(1);
}

/// Router serving `/metrics`.
pub fn metrics_router(metrics: Arc<GatewayMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<GatewayMetrics>>) -> String {
    metrics.render()
}
