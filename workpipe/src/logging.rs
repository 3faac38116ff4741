//! Tracing subscriber setup shared by host programs and the shim.

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

/// Keeps the non-blocking file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "workpipe.log";

/// Install a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. With `log_dir`
/// set, output goes to a daily-rolling file in that directory; otherwise to
/// stderr (stdout is reserved for the shim's response).
///
/// Calling this again, or after another subscriber was installed, is a no-op.
pub fn init_logging(log_dir: Option<&Path>) -> WorkpipeResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                WorkpipeError::Config(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .is_ok();
            if installed {
                let _ = LOG_GUARD.set(guard);
            }
            installed
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(log_dir = ?log_dir, "Logging initialized");
    }
    Ok(())
}
