//! Tracing setup: optional daily-rotated log file plus optional stderr echo.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));

    let mut file_error = None;
    let (file_layer, guard) = match log_file_path(&config.file) {
        Some(path) => match file_appender(&path, config.files_kept) {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                file_error = Some(format!("{}: {e}", path.display()));
                (None, None)
            }
        },
        None => (None, None),
    };
    let console_layer = config
        .console
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!("cannot open log file {e}");
    }
    guard
}

fn file_appender(
    path: &Path,
    files_kept: usize,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .map_or_else(|| "reach-agent.log".into(), |n| n.to_string_lossy());
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix.as_ref())
        .max_log_files(files_kept.max(1))
        .build(dir)
}

/// Resolve the configured log file. Relative paths sit next to the
/// executable; an empty setting disables the file.
fn log_file_path(file: &str) -> Option<PathBuf> {
    if file.is_empty() {
        return None;
    }
    let path = PathBuf::from(file);
    if path.is_absolute() {
        return Some(path);
    }
    let base = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    Some(base.join(path))
}
