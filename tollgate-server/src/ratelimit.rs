//! Fixed-window rate limiting backed by the shared KV store.
//!
//! Each client gets one counter per window, keyed
//! `rate_limit:<client>:<epoch_secs / window>`. The counter's TTL runs to the
//! end of its window so the store reclaims it without a sweep. When the store
//! is unreachable the limiter admits the request and logs a degraded event.

use std::net::IpAddr;
use tollgate_core::auth::Principal;
use tollgate_core::clock::SharedClock;
use tracing::{debug, warn};

use crate::kv::{KeyTtl, SharedKv};
use crate::metrics;

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window.
    pub limit: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            limit,
            window_secs: window_secs.max(1),
        }
    }
}

/// Who a counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKey {
    User(String),
    Ip(IpAddr),
}

impl ClientKey {
    /// Authenticated principals are limited per identity, everyone else per IP.
    pub fn for_request(principal: &Principal, ip: IpAddr) -> Self {
        if principal.authenticated {
            ClientKey::User(principal.identity.clone())
        } else {
            ClientKey::Ip(ip)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientKey::User(_) => "user",
            ClientKey::Ip(_) => "ip",
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKey::User(id) => write!(f, "user:{}", id),
            ClientKey::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// Limiter verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        limit: u64,
        remaining: u64,
        /// Seconds until the current window ends.
        reset_secs: u64,
    },
    Rejected {
        limit: u64,
        /// Seconds until the counter expires, in `1..=window`.
        retry_after: u64,
    },
    /// The store could not be consulted; the request is let through.
    Unchecked,
}

impl Admission {
    /// Seconds to wait, for a rejection.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Admission::Rejected { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

pub struct RateLimiter {
    store: SharedKv,
    clock: SharedClock,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: SharedKv, clock: SharedClock, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Counter key for `client` in the window containing `now_secs`.
    pub fn window_key(&self, client: &ClientKey, now_secs: u64) -> String {
        format!(
            "rate_limit:{}:{}",
            client,
            now_secs / self.config.window_secs
        )
    }

    /// Seconds left in the window containing `now_secs`; never zero.
    fn window_remaining(&self, now_secs: u64) -> u64 {
        self.config.window_secs - now_secs % self.config.window_secs
    }

    /// Count one request for `client` and decide whether to admit it.
    pub async fn admit(&self, client: &ClientKey) -> Admission {
        let now = self.clock.now_secs();
        let key = self.window_key(client, now);
        let window_remaining = self.window_remaining(now);

        let count = match self.store.incr(&key).await {
            Ok(count) => count.max(0) as u64,
            Err(e) => {
                warn!(client = %client, error = %e, "Rate limiter degraded, admitting request");
                metrics::record_kv_degraded("rate_limiter");
                return Admission::Unchecked;
            }
        };

        if count == 1 {
            self.apply_ttl(&key, window_remaining).await;
        } else if count == 2 || count > self.config.limit {
            // A lost EXPIRE on the first increment would leave the key forever.
            let ttl = self.ensure_ttl(&key, window_remaining).await;
            if count > self.config.limit {
                let retry_after = ttl.clamp(1, self.config.window_secs);
                debug!(client = %client, count, retry_after, "Rate limit exceeded");
                metrics::record_rate_limited(client.kind());
                return Admission::Rejected {
                    limit: self.config.limit,
                    retry_after,
                };
            }
        }

        Admission::Admitted {
            limit: self.config.limit,
            remaining: self.config.limit.saturating_sub(count),
            reset_secs: window_remaining,
        }
    }

    async fn apply_ttl(&self, key: &str, ttl: u64) {
        if let Err(e) = self.store.expire(key, ttl).await {
            warn!(key, error = %e, "Failed to set rate limit TTL");
            metrics::record_kv_degraded("rate_limiter");
        }
    }

    /// Read the key's TTL, re-applying it if missing. Returns seconds left.
    async fn ensure_ttl(&self, key: &str, window_remaining: u64) -> u64 {
        match self.store.ttl(key).await {
            Ok(KeyTtl::Expires(secs)) => secs,
            Ok(KeyTtl::Persistent) => {
                debug!(key, "Re-applying missing rate limit TTL");
                self.apply_ttl(key, window_remaining).await;
                window_remaining
            }
            Ok(KeyTtl::Missing) => window_remaining,
            Err(e) => {
                warn!(key, error = %e, "Failed to read rate limit TTL");
                metrics::record_kv_degraded("rate_limiter");
                window_remaining
            }
        }
    }
}
