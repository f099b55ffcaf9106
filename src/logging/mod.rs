//! Structured logging bootstrap: `tracing` fanned out to stdout and a rotating
//! log file, filtered by `RUST_LOG` (or a crate-scoped default built from config).

use crate::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Must be kept alive for the lifetime of the process — dropping it stops the
/// background thread that flushes the rotating file appender.
pub struct LoggingGuard(#[allow(dead_code)] WorkerGuard);

pub fn init(config: &Config) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let default_filter = format!("sora_broker={},tower_http=warn,axum=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "sora-broker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(LoggingGuard(guard))
}
