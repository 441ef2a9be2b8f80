//! Logging configuration with journald support on Linux.
//!
//! Log records go to the systemd journal when it is reachable and to a daily
//! rolling file otherwise. `--verbose` mirrors everything to stderr as well.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// Log level can be controlled via the `VIDUPE_LOG` environment variable,
/// using the usual `EnvFilter` syntax (`VIDUPE_LOG=debug`,
/// `VIDUPE_LOG=vidupe::index=trace`, ...). The default is `info`.
pub fn init(log_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("VIDUPE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "vidupe.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread; init() runs once per process
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vidupe")
        .join("logs")
}
