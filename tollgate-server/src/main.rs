//! Tollgate - API gateway.
//!
//! Sits in front of the user, order, inventory and insights services and
//! applies IP blocking, token verification, routing, authorization, rate
//! limiting and circuit breaking before proxying each request.

mod api;
mod circuit_breaker;
mod config;
mod context;
mod ip_block;
mod kv;
mod metrics;
mod pipeline;
mod proxy;
mod ratelimit;
mod shutdown;

use anyhow::{Context, Result};
use clap::Parser;
use config::{parse_ip_list, KvBackend, ServerConfig};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tollgate_core::auth::TokenVerifier;
use tollgate_core::clock;
use tollgate_core::routes::RouteTable;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{build_router, AppState};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers};
use crate::context::TrustedProxies;
use crate::ip_block::{IpBlockConfig, IpBlockGuard, IpDenyList};
use crate::kv::{MemoryStore, RedisStore, SharedKv};
use crate::metrics::GatewayMetrics;
use crate::pipeline::Gateway;
use crate::proxy::Forwarder;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::shutdown::GracefulShutdown;

const MEMORY_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Periodically drop expired entries from the in-memory store.
fn spawn_purge_task(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired KV entries");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_logging(&config);
    config.validate()?;

    info!("Starting tollgate v{}", env!("CARGO_PKG_VERSION"));
    info!(listen = %config.listen_addr(), prefix = %config.api_prefix, "Gateway configuration");

    let metrics = Arc::new(GatewayMetrics::install().context("Failed to install metrics recorder")?);
    crate::metrics::record_server_start();

    let clock = clock::system();

    let kv: SharedKv = match config.kv_backend {
        KvBackend::Redis => {
            info!(host = %config.redis_host, port = config.redis_port, db = config.redis_db, "Using Redis KV store");
            Arc::new(
                RedisStore::new(&config.redis_url()?, config.kv_timeout())
                    .context("Invalid Redis configuration")?,
            )
        }
        KvBackend::Memory => {
            warn!("Using in-memory KV store; limits and blocks are not shared between instances");
            let store = Arc::new(MemoryStore::new(clock.clone()));
            spawn_purge_task(store.clone());
            store
        }
    };

    let mut verifier = TokenVerifier::new(&config.jwt_algorithm, &config.jwt_secret)
        .context("Invalid token verification key")?
        .with_leeway(config.jwt_leeway);
    if let Some(issuer) = &config.jwt_issuer {
        verifier = verifier.with_issuer(issuer);
    }

    let routes = RouteTable::with_defaults(&config.api_prefix).context("Invalid route table")?;

    let backends = config.backend_urls()?;
    for (backend, url) in &backends {
        info!(%backend, %url, "Backend configured");
    }
    let forwarder = Forwarder::new(backends, config.backend_timeout())
        .context("Failed to build backend client")?;

    let deny_list = IpDenyList::new(&parse_ip_list(&config.ip_deny_list)?);
    let ip_guard = IpBlockGuard::new(
        kv.clone(),
        IpBlockConfig {
            threshold: config.ip_block_threshold,
            failure_ttl_secs: config.ip_failure_ttl,
            block_secs: config.ip_block_duration,
        },
        deny_list,
    );

    let limiter = RateLimiter::new(
        kv.clone(),
        clock.clone(),
        RateLimitConfig::new(config.rate_limit_requests, config.rate_limit_window),
    );

    let breakers = CircuitBreakers::new(
        CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            open_duration: std::time::Duration::from_secs(config.circuit_cooldown),
            half_open_max_trials: config.circuit_half_open_trials,
        },
        clock,
    );

    let trusted_proxies = TrustedProxies::new(parse_ip_list(&config.trusted_proxies)?);

    let gateway = Arc::new(
        Gateway::new(routes, verifier, ip_guard, limiter, breakers, forwarder)
            .with_trusted_proxies(trusted_proxies)
            .with_max_body_bytes(config.max_body_bytes),
    );

    info!(
        routes = gateway.routes().len(),
        stages = ?gateway.stage_names(),
        "Pipeline assembled"
    );

    let graceful = GracefulShutdown::new(config.shutdown_timeout());
    let shutdown = graceful.signal();

    let state = AppState::new(gateway, kv, shutdown.clone())
        .with_metrics(metrics)
        .with_admin_api_key(config.admin_api_key.clone());
    let app = build_router(state, &config.cors_origins)?;

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;
    info!("Gateway listening on {}", listener.local_addr()?);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful.wait_for_signal())
    .into_future();

    tokio::select! {
        result = server => result.context("Server error")?,
        _ = shutdown.deadline() => {
            warn!(
                in_flight = shutdown.in_flight_count(),
                timeout = ?shutdown.timeout(),
                "Graceful shutdown timed out, exiting"
            );
        }
    }

    info!("Gateway stopped");
    Ok(())
}
