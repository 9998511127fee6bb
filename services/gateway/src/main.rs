//! Chat Gateway
//!
//! Single-binary service that:
//! 1. Loads upstream credentials from a SQLite-backed store
//! 2. Serves an OpenAI-compatible API (chat, image generation, image edits)
//! 3. Leases one credential per request, rotating fairly across the pool
//! 4. Serves a control console for credential management on a second port

mod admin;
mod config;
mod error;
mod filter;
mod gateway;
mod metrics;
mod openai;
mod phase;
mod relay;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use credential_pool::{CooldownPolicy, Pool, spawn_recovery_task};
use credential_store::{CredentialStore, StoreOptions};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::UpstreamClient;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::gateway::{GatewayState, Settings};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the stale-lease sweep interval.
const MAX_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state of the health and metrics handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<Pool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router: the OpenAI-compatible API plus health and metrics.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
fn build_router(gateway: Arc<GatewayState>, state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(gateway::router(gateway))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let config = if config_path.exists() || cli_config_path.is_some() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        warn!(path = %config_path.display(), "config file not found, using defaults");
        Config::from_env().context("invalid configuration")?
    };

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        upstream = %config.upstream.base_url,
        database = %config.pool.database_path.display(),
        max_attempts = config.upstream.max_attempts,
        "configuration loaded"
    );

    // Credential store: corruption is fatal here and nowhere else
    let store = CredentialStore::open(
        &config.pool.database_path,
        StoreOptions {
            failure_threshold: config.pool.failure_threshold,
            staleness_window: config.pool.staleness_window(),
            backup_path: config.pool.backup_path(),
        },
    )
    .with_context(|| {
        format!(
            "failed to open credential store at {}",
            config.pool.database_path.display()
        )
    })?;
    let credentials = store.load().context("failed to load credentials")?;
    let store = Arc::new(store);

    let pool = Arc::new(Pool::new(
        store,
        CooldownPolicy::new(
            Duration::from_secs(config.pool.cooldown_base_secs),
            Duration::from_secs(config.pool.cooldown_max_secs),
        ),
    ));
    match pool.import_backup() {
        Ok(imported) => info!(imported, existing = credentials.len(), "credential pool ready"),
        Err(e) => warn!(error = %e, "failed to import secret backup, continuing with stored credentials"),
    }
    if pool.counts().map(|c| c.total).unwrap_or(0) == 0 {
        warn!("credential pool is empty; add credentials through the admin API");
    }

    let recovery_interval = (config.pool.staleness_window() / 2).min(MAX_RECOVERY_INTERVAL);
    let _recovery = spawn_recovery_task(pool.clone(), recovery_interval);

    let client = UpstreamClient::new(
        &config.upstream.base_url,
        Duration::from_secs(config.upstream.timeout_secs),
        Duration::from_secs(config.upstream.read_timeout_secs),
    )
    .context("failed to build upstream client")?;
    let client = match &config.images.upload_url {
        Some(url) => client.with_upload_url(url.as_str()),
        None => client,
    };
    info!(base_url = client.base_url(), "upstream client ready");

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(GatewayState {
        pool: pool.clone(),
        client,
        settings: Settings::from_config(&config),
        shutdown: shutdown.clone(),
    });
    let app_state = AppState {
        pool: pool.clone(),
        prometheus,
        started_at: Instant::now(),
    };

    let app = build_router(gateway, app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(pool));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin API to {}", config.server.admin_addr))?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. the root token is cancelled, so streams stop and release their leases
    // 3. both servers stop accepting and drain, bounded by DRAIN_TIMEOUT
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });
    let admin_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    shutdown_signal().await;
    shutdown.cancel();

    // The drain timer starts at signal receipt
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        let (public, admin) = tokio::join!(server_handle, admin_handle);
        [("public", public), ("admin", admin)]
    })
    .await;
    match drained {
        Ok(results) => {
            for (listener, result) in results {
                match result {
                    Ok(Ok(())) => info!(listener, "listener drained"),
                    Ok(Err(e)) => error!(listener, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary plus uptime. 200 while at least one
/// credential is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = match state.pool.health() {
        Ok(pool) => {
            let status = pool["status"].as_str().unwrap_or("unhealthy").to_string();
            let code = if status == "unhealthy" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (
                code,
                serde_json::json!({
                    "status": status,
                    "uptime_seconds": uptime,
                    "pool": pool,
                }),
            )
        }
        Err(e) => {
            error!(error = %e, "failed to read pool health");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "uptime_seconds": uptime,
                    "error": e.to_string(),
                }),
            )
        }
    };

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
