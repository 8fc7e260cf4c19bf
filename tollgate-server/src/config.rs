//! Server configuration.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tollgate_core::routes::{Backend, DEFAULT_API_PREFIX};
use url::Url;

/// Where rate limit counters and IP blocks are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KvBackend {
    /// Shared Redis instance, required when running more than one gateway.
    Redis,
    /// In-process store for a single gateway instance.
    Memory,
}

/// Tollgate - API gateway with auth, rate limiting and circuit breaking.
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "TOLLGATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "TOLLGATE_PORT", default_value = "8000")]
    pub port: u16,

    /// Path prefix stripped from inbound API requests
    #[arg(long, env = "TOLLGATE_API_PREFIX", default_value = DEFAULT_API_PREFIX)]
    pub api_prefix: String,

    /// Base URL of the user service
    #[arg(long, env = "TOLLGATE_USER_SERVICE_URL", default_value = "http://localhost:8001")]
    pub user_service_url: String,

    /// Base URL of the order service
    #[arg(long, env = "TOLLGATE_ORDER_SERVICE_URL", default_value = "http://localhost:8002")]
    pub order_service_url: String,

    /// Base URL of the inventory service
    #[arg(long, env = "TOLLGATE_INVENTORY_SERVICE_URL", default_value = "http://localhost:8003")]
    pub inventory_service_url: String,

    /// Base URL of the insights service
    #[arg(long, env = "TOLLGATE_INSIGHTS_SERVICE_URL", default_value = "http://localhost:8004")]
    pub insights_service_url: String,

    /// JWT verification key: shared secret for HS*, PEM public key for RS*/ES*
    #[arg(long, env = "TOLLGATE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// JWT signing algorithm
    #[arg(long, env = "TOLLGATE_JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    /// Required `iss` claim, if any
    #[arg(long, env = "TOLLGATE_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    /// Clock skew tolerated on `exp` (seconds)
    #[arg(long, env = "TOLLGATE_JWT_LEEWAY", default_value = "0")]
    pub jwt_leeway: u64,

    /// Requests admitted per client per window
    #[arg(long, env = "TOLLGATE_RATE_LIMIT_REQUESTS", default_value = "100")]
    pub rate_limit_requests: u64,

    /// Rate limit window length (seconds)
    #[arg(long, env = "TOLLGATE_RATE_LIMIT_WINDOW", default_value = "60")]
    pub rate_limit_window: u64,

    /// Consecutive failures that open a backend's circuit
    #[arg(long, env = "TOLLGATE_CIRCUIT_FAILURE_THRESHOLD", default_value = "5")]
    pub circuit_failure_threshold: u32,

    /// Time an open circuit waits before allowing trials (seconds)
    #[arg(long, env = "TOLLGATE_CIRCUIT_COOLDOWN", default_value = "30")]
    pub circuit_cooldown: u64,

    /// Concurrent trials in half-open, also the successes needed to close
    #[arg(long, env = "TOLLGATE_CIRCUIT_HALF_OPEN_TRIALS", default_value = "1")]
    pub circuit_half_open_trials: u32,

    /// Failed logins from one IP before it is blocked
    #[arg(long, env = "TOLLGATE_IP_BLOCK_THRESHOLD", default_value = "5")]
    pub ip_block_threshold: u64,

    /// Failed login counter lifetime (seconds)
    #[arg(long, env = "TOLLGATE_IP_FAILURE_TTL", default_value = "900")]
    pub ip_failure_ttl: u64,

    /// Block duration (seconds)
    #[arg(long, env = "TOLLGATE_IP_BLOCK_DURATION", default_value = "900")]
    pub ip_block_duration: u64,

    /// Static deny list (comma-separated IPs or CIDRs)
    #[arg(long, env = "TOLLGATE_IP_DENY_LIST", value_delimiter = ',')]
    pub ip_deny_list: Vec<String>,

    /// KV store backend
    #[arg(long, env = "TOLLGATE_KV_BACKEND", value_enum, default_value = "redis")]
    pub kv_backend: KvBackend,

    /// Redis host
    #[arg(long, env = "TOLLGATE_REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Redis port
    #[arg(long, env = "TOLLGATE_REDIS_PORT", default_value = "6379")]
    pub redis_port: u16,

    /// Redis username
    #[arg(long, env = "TOLLGATE_REDIS_USERNAME")]
    pub redis_username: Option<String>,

    /// Redis password
    #[arg(long, env = "TOLLGATE_REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// Redis database index
    #[arg(long, env = "TOLLGATE_REDIS_DB", default_value = "0")]
    pub redis_db: i64,

    /// Timeout for each KV store operation (milliseconds)
    #[arg(long, env = "TOLLGATE_KV_TIMEOUT_MS", default_value = "250")]
    pub kv_timeout_ms: u64,

    /// Timeout for each backend call (milliseconds)
    #[arg(long, env = "TOLLGATE_BACKEND_TIMEOUT_MS", default_value = "10000")]
    pub backend_timeout_ms: u64,

    /// Largest accepted request body (bytes)
    #[arg(long, env = "TOLLGATE_MAX_BODY_BYTES", default_value = "1048576")]
    pub max_body_bytes: usize,

    /// Proxies whose X-Forwarded-For is trusted (comma-separated IPs or CIDRs)
    #[arg(long, env = "TOLLGATE_TRUSTED_PROXIES", value_delimiter = ',')]
    pub trusted_proxies: Vec<String>,

    /// Allowed CORS origins (comma-separated, `*` for any)
    #[arg(long, env = "TOLLGATE_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// API key for the admin endpoints; admin routes are disabled when unset
    #[arg(long, env = "TOLLGATE_ADMIN_API_KEY", hide_env_values = true)]
    pub admin_api_key: Option<String>,

    /// Time allowed for in-flight requests to drain on shutdown (seconds)
    #[arg(long, env = "TOLLGATE_SHUTDOWN_TIMEOUT", default_value = "30")]
    pub shutdown_timeout: u64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "TOLLGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "TOLLGATE_LOG_JSON")]
    pub log_json: bool,
}

impl ServerConfig {
    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_requests == 0 || self.rate_limit_window == 0 {
            bail!("rate limit requests and window must be non-zero");
        }
        if self.circuit_failure_threshold == 0 || self.circuit_half_open_trials == 0 {
            bail!("circuit breaker threshold and half-open trials must be non-zero");
        }
        if self.ip_block_threshold == 0 || self.ip_failure_ttl == 0 || self.ip_block_duration == 0 {
            bail!("IP block threshold, failure TTL and block duration must be non-zero");
        }
        if self.kv_timeout_ms == 0 || self.backend_timeout_ms == 0 {
            bail!("timeouts must be non-zero");
        }
        if self.jwt_secret.is_empty() {
            bail!("JWT secret must not be empty");
        }

        self.backend_urls()?;
        if self.kv_backend == KvBackend::Redis {
            self.redis_url()?;
        }
        parse_ip_list(&self.ip_deny_list).context("invalid IP deny list")?;
        parse_ip_list(&self.trusted_proxies).context("invalid trusted proxy list")?;
        Ok(())
    }

    /// Parsed base URL per backend.
    pub fn backend_urls(&self) -> Result<HashMap<Backend, Url>> {
        let raw = [
            (Backend::User, &self.user_service_url),
            (Backend::Order, &self.order_service_url),
            (Backend::Inventory, &self.inventory_service_url),
            (Backend::Insights, &self.insights_service_url),
        ];

        raw.into_iter()
            .map(|(backend, url)| {
                let parsed = Url::parse(url)
                    .with_context(|| format!("invalid {} service URL: {}", backend, url))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    bail!("{} service URL must be http(s): {}", backend, url);
                }
                Ok((backend, parsed))
            })
            .collect()
    }

    /// Connection URL for the Redis client, with credentials percent-encoded.
    pub fn redis_url(&self) -> Result<String> {
        let base = format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db);
        let mut url = Url::parse(&base).with_context(|| format!("invalid Redis address: {}", base))?;
        if let Some(user) = &self.redis_username {
            url.set_username(user)
                .map_err(|_| anyhow!("cannot set Redis username on {}", base))?;
        }
        if let Some(pass) = &self.redis_password {
            url.set_password(Some(pass))
                .map_err(|_| anyhow!("cannot set Redis password on {}", base))?;
        }
        Ok(url.into())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn kv_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_timeout_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

/// Parse a list of IPs and CIDR ranges. Bare addresses become host networks.
pub fn parse_ip_list(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty() && !e.starts_with('#'))
        .map(|entry| {
            if let Ok(net) = entry.parse::<IpNet>() {
                Ok(net)
            } else {
                let ip: IpAddr = entry
                    .parse()
                    .with_context(|| format!("not an IP or CIDR: {}", entry))?;
                Ok(IpNet::from(ip))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec!["tollgate", "--jwt-secret", "s3cret"];
        argv.extend_from_slice(args);
        ServerConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse(&[]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.api_prefix, "/api/v1");
        assert_eq!(config.rate_limit_requests, 100);
        assert_eq!(config.rate_limit_window, 60);
        assert!(config.admin_api_key.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_limits() {
        let config = parse(&["--rate-limit-requests", "0"]);
        assert!(config.validate().is_err());

        let config = parse(&["--circuit-half-open-trials", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_urls() {
        let config = parse(&["--order-service-url", "not a url"]);
        assert!(config.validate().is_err());

        let config = parse(&["--order-service-url", "ftp://orders"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_lists() {
        let config = parse(&["--trusted-proxies", "10.0.0.0/8,127.0.0.1"]);
        let nets = parse_ip_list(&config.trusted_proxies).unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[1].contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));

        let config = parse(&["--ip-deny-list", "10.0.0.0/33"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kv_backend() {
        assert_eq!(parse(&[]).kv_backend, KvBackend::Redis);
        assert_eq!(parse(&["--kv-backend", "memory"]).kv_backend, KvBackend::Memory);
    }

    #[test]
    fn test_redis_url() {
        let config = parse(&["--redis-password", "pw", "--redis-db", "2"]);
        assert_eq!(config.redis_url().unwrap(), "redis://:pw@localhost:6379/2");

        let config = parse(&[]);
        assert_eq!(config.redis_url().unwrap(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_encodes_credentials() {
        use redis::IntoConnectionInfo;

        let config = parse(&[
            "--redis-username",
            "gate:keeper",
            "--redis-password",
            "p@ss/w#rd?",
            "--redis-db",
            "3",
        ]);
        let url = config.redis_url().unwrap();
        assert!(!url.contains("p@ss"));

        let info = url.as_str().into_connection_info().unwrap();
        assert_eq!(info.redis.username.as_deref(), Some("gate:keeper"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w#rd?"));
        assert_eq!(info.redis.db, 3);
    }
}
