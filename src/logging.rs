use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{LauncherError, Result};

const LOG_FILE_NAME: &str = "launcher.log";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Installs the process log: a daily-rolled `launcher.log` under `log_dir`,
/// mirrored to stderr when `echo_stderr` is set. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init(log_dir: &Path, echo_stderr: bool) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);
    let stderr_layer = echo_stderr.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|err| LauncherError::Config(err.to_string()))?;

    Ok(())
}
