//! Tracing initialisation for the command-line modes.

use std::fs;

use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::prelude::*;

/// Base name of the rotating log file written under the log dir.
const LOG_FILE_PREFIX: &str = "s3_upload";
/// Rotated log files to keep around.
const MAX_LOG_FILES: usize = 5;

/// Initialise console-only tracing, honouring `RUST_LOG`.
pub fn initialize_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(default_filter())
        .init();
}

/// Initialise tracing to the console plus a rotating file under `log_dir`.
///
/// The file rotates at midnight and at most [`MAX_LOG_FILES`] old files are
/// kept. The returned guard must stay alive for the duration of the
/// invocation or buffered log lines are lost.
pub fn initialize_tracing_with_log_file(log_dir: &Path) -> Result<WorkerGuard> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .with_context(|| {
            format!("could not open rotating log file in {}", log_dir.display())
        })?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(default_filter())
        .init();

    Ok(guard)
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Make sure `log_dir` exists and is writable before anything relies on it.
///
/// Creates the directory (and the `uploads/` state log subdirectory) if
/// needed; failing that is a fatal environment error at startup.
pub fn check_log_dir_writable(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir.join(crate::state_log::UPLOADS_SUBDIR)).with_context(
        || {
            format!(
                "log directory {} does not appear to be writable",
                log_dir.display()
            )
        },
    )?;
    Ok(())
}
