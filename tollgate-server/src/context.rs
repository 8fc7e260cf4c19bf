//! Request-scoped context: request ID, W3C trace context and client address.
//!
//! Trace context propagation follows https://www.w3.org/TR/trace-context/.

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Instant;
use uuid::Uuid;

/// W3C Trace Context version.
const TRACEPARENT_VERSION: &str = "00";

const ROOT_PARENT_ID: &str = "0000000000000000";

/// Longest inbound `X-Request-Id` that is reused as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Trace context for one request.
#[derive(Debug, Clone)]
pub struct TraceContext {
    /// 16 bytes, hex encoded.
    pub trace_id: String,
    /// Span ID of the caller, or zeros for a root trace.
    pub parent_span_id: String,
    /// This gateway hop's span ID.
    pub span_id: String,
    pub trace_flags: u8,
    pub trace_state: Option<String>,
}

impl TraceContext {
    /// Start a new root trace.
    pub fn root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            parent_span_id: ROOT_PARENT_ID.to_string(),
            span_id: generate_span_id(),
            trace_flags: 0x01,
            trace_state: None,
        }
    }

    /// Continue the caller's trace if it sent a valid `traceparent`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let parsed = headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_traceparent);

        match parsed {
            Some((trace_id, parent_span_id, trace_flags)) => Self {
                trace_id,
                parent_span_id,
                span_id: generate_span_id(),
                trace_flags,
                trace_state: headers
                    .get("tracestate")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string()),
            },
            None => Self::root(),
        }
    }

    /// `traceparent` value to send to the backend, naming this hop as parent.
    pub fn traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            TRACEPARENT_VERSION, self.trace_id, self.span_id, self.trace_flags
        )
    }
}

/// Everything the pipeline knows about a request before any stage runs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace: TraceContext,
    pub client_ip: IpAddr,
    /// Whether the direct peer is a trusted proxy, so its forwarding headers
    /// may be extended rather than replaced.
    pub peer_trusted: bool,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(headers: &HeaderMap, client_ip: IpAddr) -> Self {
        Self {
            request_id: request_id_from(headers),
            trace: TraceContext::from_headers(headers),
            client_ip,
            peer_trusted: false,
            started: Instant::now(),
        }
    }

    pub fn with_trusted_peer(mut self, trusted: bool) -> Self {
        self.peer_trusted = trusted;
        self
    }
}

/// Reuse a sane inbound `X-Request-Id`, otherwise mint a UUID.
pub fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| {
            !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id.chars().all(|c| c.is_ascii_graphic())
        })
        .map(|id| id.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Parse a W3C traceparent header value.
/// Format: VERSION-TRACE_ID-PARENT_ID-FLAGS
fn parse_traceparent(value: &str) -> Option<(String, String, u8)> {
    let parts: Vec<&str> = value.trim().split('-').collect();
    if parts.len() != 4 || parts[0] != TRACEPARENT_VERSION {
        return None;
    }

    let is_hex = |s: &str, len: usize| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());

    let (trace_id, parent_id) = (parts[1], parts[2]);
    if !is_hex(trace_id, 32) || !is_hex(parent_id, 16) || !is_hex(parts[3], 2) {
        return None;
    }
    // All-zero IDs are invalid.
    if trace_id.bytes().all(|b| b == b'0') || parent_id.bytes().all(|b| b == b'0') {
        return None;
    }

    let flags = u8::from_str_radix(parts[3], 16).ok()?;
    Some((
        trace_id.to_ascii_lowercase(),
        parent_id.to_ascii_lowercase(),
        flags,
    ))
}

fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>() | 1)
}

fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>() | 1)
}

/// Proxies allowed to report the client address via forwarding headers.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    nets: Vec<IpNet>,
}

impl TrustedProxies {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(ip))
    }

    /// Resolve the client address. Forwarding headers are only believed when
    /// the direct peer is a trusted proxy; the right-most untrusted hop in
    /// `X-Forwarded-For` is the client.
    pub fn client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.is_trusted(&peer) {
            return peer;
        }

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if let Some(ip) = forwarded.iter().rev().find(|ip| !self.is_trusted(ip)) {
            return *ip;
        }
        if let Some(ip) = forwarded.first() {
            return *ip;
        }

        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(peer)
    }
}
