//! LLM Quiz Solver
//!
//! Single-binary Rust service that:
//! 1. Loads the model registry, API keys and solver timing
//! 2. Starts quiz sessions on request over HTTP
//! 3. Drives each session through page fetch, answer dispatch and submission
//! 4. Exposes session control, model/key management, health and metrics

mod answer;
mod config;
mod control;
mod error;
mod events;
mod files;
mod metrics;
mod page;
mod sandbox;
mod session;
mod submit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use model_pool::{ModelPool, Registry};
use orchestrator::{FallbackOrchestrator, HybridDispatcher, RaceOrchestrator};
use provider::ModelBackend;
use provider::openrouter::OpenRouterBackend;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::control::{AppState, SessionManager, build_router};
use crate::files::HttpFileProcessor;
use crate::page::HttpPageFetcher;
use crate::sandbox::ProcessExecutor;
use crate::session::{SolverDeps, SolverSettings};
use crate::submit::HttpSubmitter;

/// Time allowed for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

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

    info!("starting llm-quiz-solver");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        base_url = %config.openrouter.base_url,
        api_keys = config.openrouter.api_keys.len(),
        quiz_secret = config.server.quiz_secret.is_some(),
        sandbox = config.sandbox.enabled,
        "configuration loaded"
    );
    if config.openrouter.api_keys.is_empty() {
        warn!("no OpenRouter API keys configured, every model call will fail");
    }

    let mut registry = Registry::builtin();
    if let Some(chain) = config.models.fallback_chain.clone() {
        registry = registry.with_fallback_chain(chain);
    }
    let pool = Arc::new(ModelPool::new(registry, config.openrouter.api_keys.clone()));

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let backend: Arc<dyn ModelBackend> = Arc::new(OpenRouterBackend::new(
        http_client.clone(),
        pool.clone(),
        config.openrouter.settings(),
    ));

    let dispatcher = HybridDispatcher::new(
        FallbackOrchestrator::new(pool.clone(), backend.clone()),
        RaceOrchestrator::new(pool.clone(), backend.clone()),
        config.solver.hybrid_settings(),
    );

    let fetch_timeout = Duration::from_secs(config.solver.fetch_timeout_secs);
    let deps = SolverDeps {
        dispatcher,
        pages: Arc::new(HttpPageFetcher::new(http_client.clone(), fetch_timeout)),
        files: Arc::new(HttpFileProcessor::new(
            http_client.clone(),
            config.solver.download_dir.clone(),
            fetch_timeout,
        )),
        executor: Arc::new(ProcessExecutor::new(
            config.sandbox.interpreter.clone(),
            Duration::from_secs(config.sandbox.timeout_secs),
        )),
        submitter: Arc::new(HttpSubmitter::new(http_client, fetch_timeout)),
        settings: SolverSettings::from_config(&config.solver, &config.sandbox),
    };

    let sessions = Arc::new(SessionManager::new(
        pool,
        backend,
        deps,
        config.server.quiz_secret.clone(),
        Duration::from_secs(config.server.finished_session_ttl_secs),
    ));

    let app = build_router(
        AppState {
            sessions: sessions.clone(),
            prometheus: prometheus_handle,
        },
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Signal the server to begin draining
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let (_, running) = sessions.counts();
            warn!(
                running_sessions = running,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    // Running solvers observe the stop at their next yield point.
    sessions.stop_all();

    info!("shutdown complete");
    Ok(())
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
