//! Request pipeline.
//!
//! Every proxied request passes through an ordered list of [`Stage`]s, each
//! of which either lets it continue or rejects it with a [`GatewayError`]:
//!
//! 1. IP block guard
//! 2. token verification
//! 3. route resolution
//! 4. authorization (`requires_auth`, then roles)
//! 5. rate limiting
//! 6. circuit breaker
//!
//! The terminal step forwards to the backend and reports the outcome to the
//! breaker and, for login routes, to the IP block guard.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tollgate_core::auth::{Principal, TokenVerifier};
use tollgate_core::error::GatewayError;
use tollgate_core::routes::{has_dot_segment, Backend, RouteConfig, RouteTable};
use tracing::{debug, error, info, warn, Level};

use crate::circuit_breaker::{CallPermit, CircuitBreakers, Outcome};
use crate::context::{RequestContext, TrustedProxies};
use crate::ip_block::{BlockStatus, IpBlockGuard};
use crate::metrics;
use crate::proxy::{ForwardError, Forwarder, ProxyRequest};
use crate::ratelimit::{Admission, ClientKey, RateLimiter};

/// Default cap on inbound request bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Route label for requests that matched no route.
const UNMATCHED_ROUTE: &str = "unmatched";

/// A resolved route, owned by the exchange.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub config: RouteConfig,
    pub target_path: String,
    /// Full pattern including the API prefix, used as the metrics label.
    pub pattern: String,
}

/// State carried through the pipeline for one request.
pub struct Exchange {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub context: RequestContext,
    pub principal: Principal,
    pub route: Option<ResolvedRoute>,
    pub admission: Option<Admission>,
    pub permit: Option<CallPermit>,
}

impl Exchange {
    pub fn new(method: Method, path: &str, query: Option<&str>, headers: HeaderMap, context: RequestContext) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: query.map(|q| q.to_string()),
            headers,
            context,
            principal: Principal::anonymous(),
            route: None,
            admission: None,
            permit: None,
        }
    }

    fn backend(&self) -> Option<Backend> {
        self.route.as_ref().map(|r| r.config.target)
    }

    fn route_label(&self) -> &str {
        self.route
            .as_ref()
            .map(|r| r.pattern.as_str())
            .unwrap_or(UNMATCHED_ROUTE)
    }
}

/// What a stage decided.
#[derive(Debug)]
pub enum StageOutcome {
    Continue,
    Reject(GatewayError),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome;
}

/// Refuse deny-listed and blocked addresses before anything else.
pub struct IpBlockStage {
    guard: Arc<IpBlockGuard>,
}

#[async_trait]
impl Stage for IpBlockStage {
    fn name(&self) -> &'static str {
        "ip_block"
    }

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome {
        let ip = exchange.context.client_ip;
        match self.guard.check(&ip).await {
            BlockStatus::Clear => StageOutcome::Continue,
            status => {
                let reason = match status {
                    BlockStatus::DenyListed => "deny_list",
                    _ => "blocked",
                };
                metrics::record_ip_blocked(reason);
                StageOutcome::Reject(
                    GatewayError::ip_blocked()
                        .with_context("ip", ip.to_string())
                        .with_context("reason", reason),
                )
            }
        }
    }
}

/// Turn the `Authorization` header into a principal.
pub struct AuthenticateStage {
    verifier: Arc<TokenVerifier>,
}

#[async_trait]
impl Stage for AuthenticateStage {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome {
        let header = exchange
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match self.verifier.authenticate(header) {
            Ok(principal) => {
                exchange.principal = principal;
                StageOutcome::Continue
            }
            Err(e) => StageOutcome::Reject(
                GatewayError::invalid_token()
                    .with_context("reason", e.to_string())
                    .with_context("ip", exchange.context.client_ip.to_string()),
            ),
        }
    }
}

pub struct RouteStage {
    routes: Arc<RouteTable>,
}

#[async_trait]
impl Stage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome {
        if has_dot_segment(&exchange.path) {
            return StageOutcome::Reject(
                GatewayError::bad_request("Path must not contain dot segments")
                    .with_context("path", exchange.path.clone()),
            );
        }
        match self.routes.resolve(&exchange.path, exchange.method.as_str()) {
            Ok(m) => {
                exchange.route = Some(ResolvedRoute {
                    config: m.route.clone(),
                    target_path: m.target_path,
                    pattern: format!("{}{}", self.routes.prefix(), m.route.path_pattern),
                });
                StageOutcome::Continue
            }
            Err(e) => StageOutcome::Reject(
                GatewayError::not_found().with_context("reason", e.to_string()),
            ),
        }
    }
}

/// Enforce `requires_auth` and the route's role set.
pub struct AuthorizeStage;

#[async_trait]
impl Stage for AuthorizeStage {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome {
        let Some(route) = &exchange.route else {
            return StageOutcome::Reject(GatewayError::not_found());
        };
        let principal = &exchange.principal;
        let ip = exchange.context.client_ip.to_string();

        if route.config.requires_auth && !principal.authenticated {
            return StageOutcome::Reject(
                GatewayError::authentication_required().with_context("ip", ip),
            );
        }

        // Roles only ever restrict authenticated principals.
        if !route.config.allowed_roles.is_empty()
            && (!principal.authenticated || !principal.is_role_allowed(&route.config.allowed_roles))
        {
            return StageOutcome::Reject(
                GatewayError::insufficient_permissions()
                    .with_context("role", principal.role.clone())
                    .with_context("ip", ip),
            );
        }

        StageOutcome::Continue
    }
}

pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome {
        let client = ClientKey::for_request(&exchange.principal, exchange.context.client_ip);
        let admission = self.limiter.admit(&client).await;
        exchange.admission = Some(admission);

        match admission.retry_after() {
            Some(secs) => StageOutcome::Reject(
                GatewayError::rate_limited(secs).with_context("client", client.to_string()),
            ),
            None => StageOutcome::Continue,
        }
    }
}

pub struct CircuitStage {
    breakers: Arc<CircuitBreakers>,
}

#[async_trait]
impl Stage for CircuitStage {
    fn name(&self) -> &'static str {
        "circuit"
    }

    async fn run(&self, exchange: &mut Exchange) -> StageOutcome {
        let Some(backend) = exchange.backend() else {
            return StageOutcome::Reject(GatewayError::not_found());
        };

        match self.breakers.allow(backend) {
            Some(permit) => {
                exchange.permit = Some(permit);
                StageOutcome::Continue
            }
            None => StageOutcome::Reject(
                GatewayError::service_unavailable()
                    .with_context("backend", backend.as_str())
                    .with_context("reason", "circuit open"),
            ),
        }
    }
}

/// The gateway: stage list plus the terminal forward step.
pub struct Gateway {
    routes: Arc<RouteTable>,
    ip_guard: Arc<IpBlockGuard>,
    breakers: Arc<CircuitBreakers>,
    forwarder: Forwarder,
    trusted_proxies: TrustedProxies,
    max_body_bytes: usize,
    stages: Vec<Box<dyn Stage>>,
}

impl Gateway {
    pub fn new(
        routes: RouteTable,
        verifier: TokenVerifier,
        ip_guard: IpBlockGuard,
        limiter: RateLimiter,
        breakers: CircuitBreakers,
        forwarder: Forwarder,
    ) -> Self {
        let routes = Arc::new(routes);
        let ip_guard = Arc::new(ip_guard);
        let breakers = Arc::new(breakers);

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(IpBlockStage {
                guard: ip_guard.clone(),
            }),
            Box::new(AuthenticateStage {
                verifier: Arc::new(verifier),
            }),
            Box::new(RouteStage {
                routes: routes.clone(),
            }),
            Box::new(AuthorizeStage),
            Box::new(RateLimitStage {
                limiter: Arc::new(limiter),
            }),
            Box::new(CircuitStage {
                breakers: breakers.clone(),
            }),
        ];

        Self {
            routes,
            ip_guard,
            breakers,
            forwarder,
            trusted_proxies: TrustedProxies::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            stages,
        }
    }

    pub fn with_trusted_proxies(mut self, trusted_proxies: TrustedProxies) -> Self {
        self.trusted_proxies = trusted_proxies;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn ip_guard(&self) -> &IpBlockGuard {
        &self.ip_guard
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one request through the pipeline.
    pub async fn handle(&self, request: Request<Body>, peer: SocketAddr) -> Response {
        let (parts, body) = request.into_parts();
        let client_ip = self.trusted_proxies.client_ip(peer.ip(), &parts.headers);
        let context = RequestContext::new(&parts.headers, client_ip)
            .with_trusted_peer(self.trusted_proxies.is_trusted(&peer.ip()));

        let mut exchange = Exchange::new(
            parts.method,
            parts.uri.path(),
            parts.uri.query(),
            parts.headers,
            context,
        );

        let mut response = match self.run_stages(&mut exchange).await {
            Err(rejection) => self.reject(&exchange, rejection),
            Ok(()) => self.forward(&mut exchange, body).await,
        };

        self.finish(&exchange, &mut response);
        response
    }

    async fn run_stages(&self, exchange: &mut Exchange) -> Result<(), GatewayError> {
        for stage in &self.stages {
            match stage.run(exchange).await {
                StageOutcome::Continue => {}
                StageOutcome::Reject(e) => {
                    debug!(stage = stage.name(), code = %e.code, "Request rejected");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn forward(&self, exchange: &mut Exchange, body: Body) -> Response {
        let (Some(route), Some(permit)) = (exchange.route.clone(), exchange.permit.take()) else {
            return self.reject(exchange, GatewayError::internal());
        };
        let backend = permit.backend();

        if let Some(len) = content_length(&exchange.headers) {
            if len > self.max_body_bytes {
                return self.reject(
                    exchange,
                    GatewayError::payload_too_large().with_context("length", len.to_string()),
                );
            }
        }

        // Dropping the permit on early return releases it without an outcome.
        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self.reject(
                    exchange,
                    GatewayError::payload_too_large().with_context("reason", e.to_string()),
                );
            }
        };

        let started = std::time::Instant::now();
        let result = self
            .forwarder
            .forward(ProxyRequest {
                method: exchange.method.clone(),
                backend,
                target_path: &route.target_path,
                query: exchange.query.as_deref(),
                headers: &exchange.headers,
                body,
                context: &exchange.context,
                principal: &exchange.principal,
            })
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(proxied) => {
                let status = proxied.status;
                permit.report(if status.is_server_error() {
                    Outcome::Failure
                } else {
                    Outcome::Success
                });
                metrics::record_upstream(backend, status.as_u16(), elapsed);

                if status.is_server_error() {
                    error!(
                        backend = %backend,
                        status = status.as_u16(),
                        request_id = %exchange.context.request_id,
                        "Backend returned server error"
                    );
                }

                if route.config.is_login && exchange.method == Method::POST {
                    let ip = exchange.context.client_ip;
                    if status == StatusCode::UNAUTHORIZED {
                        self.ip_guard.record_login_failure(&ip).await;
                    } else if status.is_success() {
                        self.ip_guard.record_login_success(&ip).await;
                    }
                }

                (proxied.status, proxied.headers, proxied.body).into_response()
            }
            Err(e @ ForwardError::InvalidJsonBody(_)) => {
                drop(permit);
                self.reject(
                    exchange,
                    GatewayError::invalid_json_body().with_context("reason", e.to_string()),
                )
            }
            Err(e) if e.is_transport() => {
                permit.report(Outcome::Failure);
                metrics::record_upstream_error(backend, e.kind());
                self.reject(
                    exchange,
                    GatewayError::service_unavailable()
                        .with_context("backend", backend.as_str())
                        .with_context("reason", e.to_string()),
                )
            }
            Err(e @ ForwardError::PathMismatch { .. }) => {
                drop(permit);
                self.reject(
                    exchange,
                    GatewayError::bad_request("Path cannot be forwarded")
                        .with_context("reason", e.to_string()),
                )
            }
            Err(e) => {
                drop(permit);
                self.reject(
                    exchange,
                    GatewayError::internal().with_context("reason", e.to_string()),
                )
            }
        }
    }

    /// Build the client-facing response for a gateway rejection.
    fn reject(&self, exchange: &Exchange, err: GatewayError) -> Response {
        let ctx = &exchange.context;
        let ip = ctx.client_ip.to_string();
        match err.log_level() {
            Level::ERROR => error!(request_id = %ctx.request_id, ip = %ip, path = %exchange.path, "{}", err),
            Level::WARN => warn!(request_id = %ctx.request_id, ip = %ip, path = %exchange.path, "{}", err),
            _ => info!(request_id = %ctx.request_id, ip = %ip, path = %exchange.path, "{}", err),
        }
        metrics::record_rejection(err.code);
        error_response(&err)
    }

    /// Headers and accounting common to every response.
    fn finish(&self, exchange: &Exchange, response: &mut Response) {
        let headers = response.headers_mut();
        if let Ok(id) = HeaderValue::from_str(&exchange.context.request_id) {
            headers.insert("x-request-id", id);
        }

        match exchange.admission {
            Some(Admission::Admitted {
                limit,
                remaining,
                reset_secs,
            }) => {
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
                headers.insert("x-ratelimit-reset", HeaderValue::from(reset_secs));
            }
            Some(Admission::Rejected { limit, .. }) => {
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(0u64));
            }
            _ => {}
        }

        let status = response.status().as_u16();
        let elapsed = exchange.context.started.elapsed();
        metrics::record_request(
            exchange.route_label(),
            exchange.backend(),
            status,
            elapsed.as_secs_f64(),
        );
        info!(
            method = %exchange.method,
            path = %exchange.path,
            route = exchange.route_label(),
            status,
            latency_ms = elapsed.as_millis() as u64,
            request_id = %exchange.context.request_id,
            trace_id = %exchange.context.trace.trace_id,
            parent_span_id = %exchange.context.trace.parent_span_id,
            "Request completed"
        );
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// JSON error body with the standard shape, plus `Retry-After` when set.
pub fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(err.body())).into_response();
    if let Some(secs) = err.retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

/// Axum handler for everything not served by the gateway's own endpoints.
pub async fn gateway_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    gateway.handle(request, peer).await
}
