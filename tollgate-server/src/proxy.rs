//! HTTP forwarding to backend services.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tollgate_core::auth::Principal;
use tollgate_core::routes::Backend;
use tracing::{debug, error};
use url::Url;

use crate::context::RequestContext;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers replaced by the gateway's own values.
const GATEWAY_OWNED: &[&str] = &[
    "host",
    "content-length",
    "x-request-id",
    "x-forwarded-for",
    "traceparent",
    "tracestate",
    "x-user-id",
    "x-user-role",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Request body is not valid JSON: {0}")]
    InvalidJsonBody(String),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("Backend path {actual} does not match routed path {expected}")]
    PathMismatch { expected: String, actual: String },

    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend unreachable: {0}")]
    Connect(String),

    #[error("Backend transport error: {0}")]
    Transport(String),
}

impl ForwardError {
    /// Whether the backend was actually attempted and failed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ForwardError::Timeout(_) | ForwardError::Connect(_) | ForwardError::Transport(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::InvalidJsonBody(_) => "invalid_json",
            ForwardError::InvalidUrl(_) => "invalid_url",
            ForwardError::PathMismatch { .. } => "path_mismatch",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Connect(_) => "connect",
            ForwardError::Transport(_) => "transport",
        }
    }
}

/// One request to forward.
pub struct ProxyRequest<'a> {
    pub method: Method,
    pub backend: Backend,
    /// Path with the API prefix already removed.
    pub target_path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub context: &'a RequestContext,
    pub principal: &'a Principal,
}

/// A backend response, relayed verbatim.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct Forwarder {
    client: reqwest::Client,
    backends: HashMap<Backend, Url>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(backends: HashMap<Backend, Url>, timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
            .tcp_nodelay(true)
            .no_proxy()
            .build()
            .map_err(|e| {
                error!(error = %e, "Failed to build HTTP client");
                ForwardError::Transport(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            client,
            backends,
            timeout,
        })
    }

    /// Send the request and collect the backend's full response.
    pub async fn forward(&self, req: ProxyRequest<'_>) -> Result<ProxyResponse, ForwardError> {
        let base = self
            .backends
            .get(&req.backend)
            .ok_or_else(|| ForwardError::InvalidUrl(format!("no URL for {}", req.backend)))?;
        let url = build_url(base, req.target_path, req.query)?;
        let headers = outbound_headers(req.headers, req.context, req.principal);
        let body = prepare_body(req.headers, req.body)?;

        debug!(
            backend = %req.backend,
            method = %req.method,
            url = %url,
            request_id = %req.context.request_id,
            "Forwarding request"
        );

        let response = self
            .client
            .request(req.method, url)
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let headers = inbound_headers(response.headers());
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }

    fn classify(&self, e: reqwest::Error) -> ForwardError {
        if e.is_timeout() {
            ForwardError::Timeout(self.timeout)
        } else if e.is_connect() {
            ForwardError::Connect(sanitize(&e))
        } else {
            ForwardError::Transport(sanitize(&e))
        }
    }
}

fn sanitize(e: &reqwest::Error) -> String {
    if e.is_connect() {
        "connection refused or unreachable".to_string()
    } else if e.is_body() {
        "response body error".to_string()
    } else if e.is_request() {
        "request failed".to_string()
    } else {
        "network error".to_string()
    }
}

/// Join the backend base URL and target path; keep the first value of each
/// query key.
fn build_url(base: &Url, target_path: &str, query: Option<&str>) -> Result<Url, ForwardError> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), target_path);
    let mut url = Url::parse(&joined).map_err(|e| ForwardError::InvalidUrl(e.to_string()))?;
    url.set_query(None);

    // The parser may re-encode characters but must not add or drop segments.
    let expected = format!("{}{}", base.path().trim_end_matches('/'), target_path);
    if url.path().split('/').count() != expected.split('/').count() {
        return Err(ForwardError::PathMismatch {
            expected,
            actual: url.path().to_string(),
        });
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        let mut seen = HashSet::new();
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(k, _)| seen.insert(k.to_string()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
    }

    Ok(url)
}

/// Connection-scoped names: the fixed hop-by-hop set plus anything listed in
/// the `Connection` header.
fn connection_scoped(headers: &HeaderMap) -> HashSet<String> {
    let mut names: HashSet<String> = HOP_BY_HOP.iter().map(|s| s.to_string()).collect();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            names.extend(
                value
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }
    }
    names
}

fn outbound_headers(inbound: &HeaderMap, ctx: &RequestContext, principal: &Principal) -> HeaderMap {
    let skip = connection_scoped(inbound);
    let mut out = HeaderMap::new();

    for name in inbound.keys() {
        let lower = name.as_str();
        if skip.contains(lower) || GATEWAY_OWNED.contains(&lower) {
            continue;
        }
        // First value wins on duplicates.
        if let Some(value) = inbound.get(name) {
            out.insert(name.clone(), value.clone());
        }
    }

    // An untrusted peer's chain is dropped, not extended.
    let forwarded_for = match inbound
        .get("x-forwarded-for")
        .filter(|_| ctx.peer_trusted)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(existing) => format!("{}, {}", existing, ctx.client_ip),
        None => ctx.client_ip.to_string(),
    };

    insert(&mut out, "x-forwarded-for", &forwarded_for);
    insert(&mut out, "x-request-id", &ctx.request_id);
    insert(&mut out, "traceparent", &ctx.trace.traceparent());
    if let Some(state) = &ctx.trace.trace_state {
        insert(&mut out, "tracestate", state);
    }

    if principal.authenticated {
        insert(&mut out, "x-user-id", &principal.identity);
        insert(&mut out, "x-user-role", &principal.role);
    }

    out
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn inbound_headers(backend: &HeaderMap) -> HeaderMap {
    let skip = connection_scoped(backend);
    let mut out = HeaderMap::new();
    for (name, value) in backend {
        if skip.contains(name.as_str()) || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn declares_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Re-serialize a JSON body, pass anything else through untouched.
fn prepare_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, ForwardError> {
    if body.is_empty() || !declares_json(headers) {
        return Ok(body);
    }

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ForwardError::InvalidJsonBody(e.to_string()))?;
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| ForwardError::InvalidJsonBody(e.to_string()))
}
