//! sora-broker: a multi-tenant gateway brokering access to the Sora
//! image/video generation upstream, fronted as a chat-completion-compatible
//! streaming API.
//!
//! Architecture:
//! - `tokens`: the credential pool, load balancer, per-token lock/concurrency state
//! - `sentinel` / `pow`: anti-automation challenge acquisition and caching
//! - `upstream`: the HTTP client for the proprietary generation backend
//! - `generation`: the request handler tying the above together per caller request
//! - `cache`: content-addressed download cache for produced media
//! - `server` / `admin`: the caller-facing and operator-facing HTTP surfaces

mod admin;
mod cache;
mod cli;
mod config;
mod db;
mod error;
mod fingerprint;
mod generation;
mod logging;
mod pow;
mod proxy_resolver;
mod request_log;
mod sentinel;
mod server;
mod state;
mod tasks;
mod tokens;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use config::Config;
use generation::GenerationContext;
use request_log::RequestLog;
use state::AppState;
use tokens::{ConcurrencyManager, LockTable, TokenStore};

#[tokio::main]
async fn main() -> Result<()> {
    if cli::handle_cli() {
        return Ok(());
    }

    Config::ensure_config_exists();
    let config = Config::from_env();

    let _logging_guard = logging::init(&config).context("initializing logging")?;
    tracing::info!(version = %config::VERSION, bind_addr = %config.bind_addr, "starting sora-broker");

    let pool = db::open(&config.db_path).context("opening database")?;

    let tokens = Arc::new(TokenStore::new(pool.clone()).context("loading token pool")?);
    let locks = Arc::new(LockTable::new());
    let concurrency = Arc::new(ConcurrencyManager::new());
    let sentinel = Arc::new(sentinel::SentinelService::new(None));
    let upstream = Arc::new(upstream::UpstreamClient::new(config.sora_base_url.clone()));
    let proxy = Arc::new(proxy_resolver::ProxyResolver::new(
        config.proxy_url.clone(),
        config.pow_proxy_url.clone(),
        config.pow_proxy_enabled,
    ));
    let cache = Arc::new(cache::FileCache::new(config.cache.clone()));
    cache.spawn_sweeper(Duration::from_secs(300));
    let tasks = Arc::new(tasks::TaskStore::new(pool.clone()));
    let request_log = RequestLog::new(pool);

    let generation = GenerationContext {
        tokens,
        locks,
        concurrency,
        sentinel,
        upstream,
        proxy,
        cache,
        tasks,
        admin: config.admin.clone(),
    };

    let state = AppState::new(generation, request_log, &config);
    let app = server::build(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding to {}", config.bind_addr))?;

    tracing::info!("sora-broker listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("sora-broker shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
