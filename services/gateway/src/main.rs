//! Credential pool gateway
//!
//! Single-binary service that owns the account pool control plane: loads
//! credentials from disk, registers the per-provider executors, runs the
//! background token refresh coordinator, and exposes health, Prometheus
//! metrics, and the management API. The LLM-compatible entry façades are
//! separate collaborators that drive the manager through its library
//! surface.

mod config;
mod management;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use account_pool::{spawn_refresh_task, Manager, RoundRobinSelector, SessionAffinity};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use credential::FileAuthStore;
use executor::claude::ClaudeExecutor;
use executor::codex::CodexExecutor;
use executor::gemini::GeminiExecutor;
use executor::openai::OpenAiCompatExecutor;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage_events::EventStreamManager;

use crate::config::Config;
use crate::management::ManagementState;

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
    prometheus: PrometheusHandle,
}

/// Concurrent management requests; snapshot copies are cheap but bounded.
const MANAGEMENT_MAX_CONCURRENCY: usize = 64;

fn build_router(state: AppState, management: ManagementState) -> Router {
    let management_routes = management::router(management)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            MANAGEMENT_MAX_CONCURRENCY,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .nest("/v0/management", management_routes)
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

    info!("starting credential pool gateway");

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        listen_addr = %config.server.listen_addr,
        auth_dir = %config.auth_dir.display(),
        "configuration loaded"
    );

    // Core wiring: store -> manager -> executors -> refresh loop.
    let store = Arc::new(FileAuthStore::new(&config.auth_dir));
    let usage = EventStreamManager::default_shared();
    let affinity = SessionAffinity::default_shared();
    let manager = Manager::builder(Box::new(RoundRobinSelector::new(affinity)))
        .with_store(store)
        .with_usage_stream(usage.clone())
        .build();
    manager.set_config(config.pool.clone()).await;
    manager
        .set_retry_config(
            config.retry.max_attempts,
            Duration::from_secs(config.retry.max_wait_secs),
        )
        .await;

    manager.register_executor(Arc::new(CodexExecutor::new())).await;
    manager.register_executor(Arc::new(ClaudeExecutor::new())).await;
    manager.register_executor(Arc::new(GeminiExecutor::new())).await;
    manager
        .register_executor(Arc::new(OpenAiCompatExecutor::new("openai")))
        .await;

    let loaded = manager
        .load_from_store()
        .await
        .map_err(|e| anyhow::anyhow!("loading credentials: {e}"))?;
    info!(accounts = loaded, "credentials loaded");

    let refresh_task = spawn_refresh_task(
        Arc::clone(&manager),
        Duration::from_secs(config.refresh.interval_secs),
        Duration::from_secs(config.refresh.threshold_secs),
    );

    let queue = prompt_queue::Manager::new(prompt_queue::Config {
        store_dir: config
            .prompt_queue
            .store_dir
            .clone()
            .or_else(|| Some(prompt_queue::default_store_dir())),
        session_queue_size: config.prompt_queue.session_queue_size.unwrap_or(0),
        ..prompt_queue::Config::default()
    });

    let management = ManagementState {
        manager: Arc::clone(&manager),
        queue,
        usage,
        management_key: Arc::new(common::Secret::new(config.management_key.clone())),
        listen_port: config.server.listen_addr.port(),
    };
    let state = AppState {
        manager: Arc::clone(&manager),
        prometheus,
    };

    let app = build_router(state, management);
    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(listen_addr = %config.server.listen_addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    refresh_task.abort();
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Pool health: healthy when every account is available, degraded when some
/// are blocked, unhealthy when none can serve.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshots = state.manager.auth_snapshots().await;
    let total = snapshots.len();
    let available = snapshots
        .iter()
        .filter(|s| !s.disabled && !s.unavailable)
        .count();
    let status = if total > 0 && available == total {
        "healthy"
    } else if available > 0 {
        "degraded"
    } else {
        "unhealthy"
    };
    Json(serde_json::json!({
        "status": status,
        "accounts_total": total,
        "accounts_available": available,
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}
