//! Source IP blocking.
//!
//! Two independent sources of blocks:
//! - a static deny list of IPs and CIDR ranges, loaded from config;
//! - dynamic blocks set after repeated failed logins, stored in the KV store
//!   under two key families, `login_fail:<ip>` (failure counter) and
//!   `ip_block:<ip>` (the block flag). Each has its own TTL.

use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::kv::{KeyTtl, SharedKv};
use crate::metrics;

/// Static deny list checked before any KV lookup.
#[derive(Debug, Default, Clone)]
pub struct IpDenyList {
    ips: HashSet<IpAddr>,
    cidrs: Vec<IpNet>,
}

impl IpDenyList {
    pub fn new(entries: &[IpNet]) -> Self {
        let mut list = Self::default();
        for net in entries {
            if net.prefix_len() == net.max_prefix_len() {
                list.ips.insert(net.addr());
            } else {
                list.cidrs.push(*net);
            }
        }
        list
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip) || self.cidrs.iter().any(|cidr| cidr.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.ips.len() + self.cidrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dynamic block policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlockConfig {
    /// Failed logins that trigger a block.
    pub threshold: u64,
    /// Failure counter lifetime, refreshed on every failure.
    pub failure_ttl_secs: u64,
    /// Block lifetime.
    pub block_secs: u64,
}

impl Default for IpBlockConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            failure_ttl_secs: 900,
            block_secs: 900,
        }
    }
}

/// Why an address is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Clear,
    DenyListed,
    Blocked,
}

/// Snapshot of an address's block state, for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpBlockReport {
    pub ip: String,
    pub blocked: bool,
    pub deny_listed: bool,
    pub failures: u64,
    /// Seconds left on the block, if any.
    pub block_ttl: Option<u64>,
}

/// Result of an operator clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub block_removed: bool,
    pub failures_removed: bool,
}

pub struct IpBlockGuard {
    store: SharedKv,
    config: IpBlockConfig,
    deny_list: IpDenyList,
}

fn failure_key(ip: &IpAddr) -> String {
    format!("login_fail:{}", ip)
}

fn block_key(ip: &IpAddr) -> String {
    format!("ip_block:{}", ip)
}

impl IpBlockGuard {
    pub fn new(store: SharedKv, config: IpBlockConfig, deny_list: IpDenyList) -> Self {
        if !deny_list.is_empty() {
            info!(entries = deny_list.len(), "Static IP deny list loaded");
        }
        Self {
            store,
            config,
            deny_list,
        }
    }

    /// Check an address. KV errors fail open.
    pub async fn check(&self, ip: &IpAddr) -> BlockStatus {
        if self.deny_list.contains(ip) {
            debug!(%ip, "IP is on the static deny list");
            return BlockStatus::DenyListed;
        }

        match self.store.get(&block_key(ip)).await {
            Ok(Some(_)) => BlockStatus::Blocked,
            Ok(None) => BlockStatus::Clear,
            Err(e) => {
                warn!(%ip, error = %e, "IP block check degraded, allowing request");
                metrics::record_kv_degraded("ip_block");
                BlockStatus::Clear
            }
        }
    }

    /// Count a failed login. At the threshold the address is blocked and its
    /// failure counter reset, so a later block needs a full new run.
    pub async fn record_login_failure(&self, ip: &IpAddr) {
        let key = failure_key(ip);

        let failures = match self.store.incr(&key).await {
            Ok(n) => n.max(0) as u64,
            Err(e) => {
                warn!(%ip, error = %e, "Failed to record login failure");
                metrics::record_kv_degraded("ip_block");
                return;
            }
        };

        if let Err(e) = self.store.expire(&key, self.config.failure_ttl_secs).await {
            warn!(%ip, error = %e, "Failed to set login failure TTL");
            metrics::record_kv_degraded("ip_block");
        }

        debug!(%ip, failures, threshold = self.config.threshold, "Login failure recorded");

        if failures < self.config.threshold {
            return;
        }

        match self
            .store
            .set(&block_key(ip), "1", Some(self.config.block_secs))
            .await
        {
            Ok(()) => {
                warn!(%ip, failures, block_secs = self.config.block_secs, "IP blocked after failed logins");
                metrics::record_ip_blocked("login_failures");
                if let Err(e) = self.store.del(&key).await {
                    warn!(%ip, error = %e, "Failed to reset login failure counter");
                }
            }
            Err(e) => {
                warn!(%ip, error = %e, "Failed to set IP block");
                metrics::record_kv_degraded("ip_block");
            }
        }
    }

    /// A successful login resets the failure counter. An existing block stays.
    pub async fn record_login_success(&self, ip: &IpAddr) {
        if let Err(e) = self.store.del(&failure_key(ip)).await {
            warn!(%ip, error = %e, "Failed to reset login failures");
            metrics::record_kv_degraded("ip_block");
        }
    }

    /// Operator remediation: remove both the block and the failure counter.
    pub async fn clear(&self, ip: &IpAddr) -> Result<ClearOutcome, crate::kv::KvError> {
        let block_removed = self.store.del(&block_key(ip)).await?;
        let failures_removed = self.store.del(&failure_key(ip)).await?;
        info!(%ip, block_removed, failures_removed, "IP block cleared");
        Ok(ClearOutcome {
            block_removed,
            failures_removed,
        })
    }

    /// Current state of an address.
    pub async fn report(&self, ip: &IpAddr) -> Result<IpBlockReport, crate::kv::KvError> {
        let failures = self
            .store
            .get(&failure_key(ip))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let block_ttl = match self.store.ttl(&block_key(ip)).await? {
            KeyTtl::Missing => None,
            KeyTtl::Persistent => Some(0),
            KeyTtl::Expires(secs) => Some(secs),
        };

        Ok(IpBlockReport {
            ip: ip.to_string(),
            blocked: block_ttl.is_some(),
            deny_listed: self.deny_list.contains(ip),
            failures,
            block_ttl,
        })
    }
}
