//! Gateway HTTP surface: health, metrics, admin endpoints, and the proxy
//! fallback, wrapped in the cross-cutting layers.
//!
//! Admin endpoints require an API key and are not mounted when none is
//! configured.

use crate::kv::SharedKv;
use crate::metrics::{metrics_router, GatewayMetrics};
use crate::pipeline::{error_response, gateway_handler, Gateway};
use crate::shutdown::ShutdownSignal;
use axum::{
    body::Body,
    extract::{FromRef, Path, State},
    http::{
        header::{AUTHORIZATION, CONNECTION, RETRY_AFTER},
        HeaderName, HeaderValue, Request,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tollgate_core::error::GatewayError;
use tollgate_core::routes::Backend;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitSnapshot;

pub const SERVICE_NAME: &str = "tollgate";
const HEALTH_PATH: &str = "/health";

/// Health response. Always served with 200; `status` carries the verdict.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub kv_store: &'static str,
    /// Whether each backend's breaker currently admits calls.
    pub backends: BTreeMap<&'static str, bool>,
}

#[derive(Debug, Serialize)]
pub struct CircuitListResponse {
    pub circuits: Vec<CircuitSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub ip: String,
    pub block_removed: bool,
    pub failures_removed: bool,
}

/// Shared state for the gateway's own endpoints.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub kv: SharedKv,
    pub metrics: Option<Arc<GatewayMetrics>>,
    pub started: Instant,
    /// API key for the admin endpoints (None = admin API disabled).
    pub admin_api_key: Option<String>,
    pub shutdown: ShutdownSignal,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, kv: SharedKv, shutdown: ShutdownSignal) -> Self {
        Self {
            gateway,
            kv,
            metrics: None,
            started: Instant::now(),
            admin_api_key: None,
            shutdown,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_admin_api_key(mut self, key: Option<String>) -> Self {
        self.admin_api_key = key.filter(|k| !k.is_empty());
        self
    }
}

impl FromRef<AppState> for Arc<Gateway> {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

/// Build the complete application router.
pub fn build_router(state: AppState, cors_origins: &[String]) -> anyhow::Result<Router> {
    let mut app = Router::new().route(HEALTH_PATH, get(health_handler));

    if state.admin_api_key.is_some() {
        let admin_routes = Router::new()
            .route("/admin/circuits", get(list_circuits_handler))
            .route("/admin/circuits/:backend/reset", post(reset_circuit_handler))
            .route(
                "/admin/ip-blocks/:ip",
                get(ip_block_report_handler).delete(clear_ip_block_handler),
            )
            .layer(middleware::from_fn_with_state(state.clone(), require_api_key));
        app = app.merge(admin_routes);
    } else {
        info!("No admin API key configured, admin endpoints disabled");
    }

    let metrics = state.metrics.clone();
    let shutdown = state.shutdown.clone();

    let mut app = app.fallback(gateway_handler).with_state(state);
    if let Some(metrics) = metrics {
        app = app.merge(metrics_router(metrics));
    }

    Ok(app.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(cors_origins)?)
            .layer(middleware::from_fn_with_state(shutdown, track_in_flight)),
    ))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins = origins
            .iter()
            .map(|o| HeaderValue::from_str(o.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin)
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            RETRY_AFTER,
        ]))
}

/// Panics become a generic 500; the payload is only logged.
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    let err = GatewayError::internal().with_context("panic", detail);
    error!("{}", err);
    error_response(&err)
}

/// Refuse requests that arrive once shutdown has begun. `/health` stays
/// available and reports the shutdown in its body.
async fn track_in_flight(
    State(shutdown): State<ShutdownSignal>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }
    let Some(_guard) = shutdown.track() else {
        let mut response = error_response(
            &GatewayError::service_unavailable().with_message("Server is shutting down"),
        );
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        return response;
    };
    next.run(request).await
}

/// Middleware to require the admin API key.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_key) = &state.admin_api_key else {
        return error_response(&GatewayError::not_found());
    };

    let provided_key = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(header) if header.starts_with("Bearer ") => Some(&header[7..]),
        _ => request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok()),
    };

    match provided_key {
        Some(key) if key == expected_key => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Invalid admin API key provided");
            error_response(&GatewayError::invalid_token().with_message("Invalid API key"))
        }
        None => {
            warn!(path = %request.uri().path(), "Admin API key required but not provided");
            error_response(&GatewayError::authentication_required().with_message(
                "API key required. Provide via Authorization: Bearer <key> or X-API-Key header",
            ))
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let kv_ok = match state.kv.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(store = state.kv.backend_name(), error = %e, "KV store health check failed");
            false
        }
    };

    let breakers = state.gateway.breakers();
    let backends: BTreeMap<&'static str, bool> = Backend::ALL
        .iter()
        .map(|&b| (b.as_str(), breakers.get(b).would_allow()))
        .collect();

    let healthy = kv_ok && backends.values().all(|&up| up);
    let status = if state.shutdown.is_shutting_down() {
        "shutting_down"
    } else if healthy {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
        kv_store: if kv_ok { "connected" } else { "unavailable" },
        backends,
    })
}

async fn list_circuits_handler(State(state): State<AppState>) -> Json<CircuitListResponse> {
    Json(CircuitListResponse {
        circuits: state.gateway.breakers().snapshots(),
    })
}

async fn reset_circuit_handler(
    State(state): State<AppState>,
    Path(backend): Path<String>,
) -> Response {
    let backend: Backend = match backend.parse() {
        Ok(b) => b,
        Err(e) => {
            return error_response(&GatewayError::not_found().with_message(e.to_string()));
        }
    };

    state.gateway.breakers().reset(backend);
    info!(%backend, "Circuit reset via admin API");
    Json(state.gateway.breakers().get(backend).snapshot()).into_response()
}

fn parse_ip(raw: &str) -> Result<IpAddr, Response> {
    raw.parse().map_err(|_| {
        error_response(&GatewayError::bad_request(format!(
            "'{}' is not a valid IP address",
            raw
        )))
    })
}

async fn ip_block_report_handler(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Response {
    let ip = match parse_ip(&ip) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    match state.gateway.ip_guard().report(&ip).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(%ip, error = %e, "IP block lookup failed");
            error_response(&GatewayError::service_unavailable().with_context("reason", e.to_string()))
        }
    }
}

async fn clear_ip_block_handler(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Response {
    let ip = match parse_ip(&ip) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    match state.gateway.ip_guard().clear(&ip).await {
        Ok(outcome) => {
            info!(%ip, block_removed = outcome.block_removed, "IP block cleared via admin API");
            Json(ClearResponse {
                ip: ip.to_string(),
                block_removed: outcome.block_removed,
                failures_removed: outcome.failures_removed,
            })
            .into_response()
        }
        Err(e) => {
            warn!(%ip, error = %e, "IP block clear failed");
            error_response(&GatewayError::service_unavailable().with_context("reason", e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{body_json, dead_backend, harness, stub_backend, Harness, HarnessConfig};
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    const ADMIN_KEY: &str = "admin-secret";

    fn app(h: &Harness, admin_key: Option<&str>) -> (Router, ShutdownSignal) {
        let shutdown = ShutdownSignal::new(Duration::from_secs(5));
        let state = AppState::new(h.gateway.clone(), h.store.clone(), shutdown.clone())
            .with_admin_api_key(admin_key.map(str::to_string));
        (build_router(state, &["*".to_string()]).unwrap(), shutdown)
    }

    async fn call(router: &Router, mut request: Request<Body>) -> Response {
        let peer: SocketAddr = "198.51.100.30:41000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(request).await.unwrap()
    }

    fn admin(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", ADMIN_KEY))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_kv_and_backends() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, None);

        let response = call(&router, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "tollgate");
        assert_eq!(body["kv_store"], "connected");
        assert_eq!(body["backends"]["order"], true);
        assert_eq!(body["backends"].as_object().unwrap().len(), 4);

        h.store.set_offline(true);
        let response = call(&router, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["kv_store"], "unavailable");
    }

    #[tokio::test]
    async fn test_proxy_fallback_is_mounted() {
        let (backend, _) = stub_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, None);

        let response = call(
            &router,
            Request::builder()
                .uri("/api/v1/inventory/assets")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, None);

        let response = call(
            &router,
            Request::builder()
                .method("OPTIONS")
                .uri("/api/v1/orders")
                .header("origin", "https://app.example")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_admin_disabled_without_key() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, None);

        let response = call(&router, admin("GET", "/admin/circuits")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_requires_key() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, Some(ADMIN_KEY));

        let response = call(
            &router,
            Request::builder().uri("/admin/circuits").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = call(
            &router,
            Request::builder()
                .uri("/admin/circuits")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = call(
            &router,
            Request::builder()
                .uri("/admin/circuits")
                .header("x-api-key", ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["circuits"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_admin_circuit_reset() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, Some(ADMIN_KEY));

        let response = call(&router, admin("POST", "/admin/circuits/teapots/reset")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(&router, admin("POST", "/admin/circuits/order/reset")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["backend"], "order");
        assert_eq!(body["state"], "closed");
    }

    #[tokio::test]
    async fn test_admin_ip_blocks() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, _) = app(&h, Some(ADMIN_KEY));

        let ip: IpAddr = "203.0.113.77".parse().unwrap();
        for _ in 0..5 {
            h.gateway.ip_guard().record_login_failure(&ip).await;
        }

        let response = call(&router, admin("GET", "/admin/ip-blocks/203.0.113.77")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["blocked"], true);

        let response = call(&router, admin("DELETE", "/admin/ip-blocks/203.0.113.77")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["block_removed"], true);

        let response = call(&router, admin("GET", "/admin/ip-blocks/203.0.113.77")).await;
        let body = body_json(response).await;
        assert_eq!(body["blocked"], false);
        assert_eq!(body["failures"], 0);

        let response = call(&router, admin("GET", "/admin/ip-blocks/not-an-ip")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_requests_refused_during_shutdown() {
        let (backend, hits) = stub_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, shutdown) = app(&h, None);

        shutdown.initiate_shutdown();
        let response = call(
            &router,
            Request::builder()
                .uri("/api/v1/inventory/assets")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONNECTION], "close");
        assert_eq!(hits.total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_served_during_shutdown() {
        let backend = dead_backend().await;
        let h = harness(&backend, HarnessConfig::default());
        let (router, shutdown) = app(&h, None);

        shutdown.initiate_shutdown();
        let response = call(&router, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(CONNECTION));
        let body = body_json(response).await;
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn test_panic_becomes_generic_500() {
        let response = handle_panic(Box::new("index out of bounds"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["code"], "internal-error");
        assert!(!body["message"].as_str().unwrap().contains("index"));
    }
}
