//! Mediactl daemon entry point.
//!
//! Binds the control socket, resets the shared tables, and serves requests
//! until the idle timer finds no attached servers or clients.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mediactl_daemon::DaemonConfig;

/// Mediactl daemon - privileged arbiter for the media control plane
#[derive(Parser, Debug)]
#[command(name = "mediactl-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Custom control socket path (defaults to `$XDG_RUNTIME_DIR/mediactl.sock`)
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Custom table file path (defaults to `$XDG_RUNTIME_DIR/mediactl-tables.json`)
    #[arg(long, value_name = "PATH")]
    table_path: Option<PathBuf>,

    /// Idle-check period in seconds
    #[arg(long, value_name = "SECS")]
    idle_period: Option<u64>,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mediactl={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("mediactl-daemon-{timestamp}.log");

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging();

    info!("starting mediactl daemon...");

    let mut config = DaemonConfig::new();
    if let Some(path) = args.socket_path {
        config.socket_path = path;
    }
    if let Some(path) = args.table_path {
        config.table_path = path;
    }
    if let Some(secs) = args.idle_period {
        config.idle_period = Duration::from_secs(secs);
    }

    mediactl_daemon::run(config).await?;

    info!("mediactl daemon stopped");
    Ok(())
}
