use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize `tracing` once. Respects `RUST_LOG`; falls back to `default_level`.
pub fn init(default_level: &str) {
    let _ = fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Like [`init`], and also writes a daily-rotated `<dir>/<file_prefix>.log.<date>`.
/// The returned guard flushes the file writer and must outlive the program's logging.
pub fn init_with_file(default_level: &str, dir: &Path, file_prefix: &str) -> Option<WorkerGuard> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        init(default_level);
        tracing::warn!("log dir {} unavailable, logging to stderr only: {}", dir.display(), e);
        return None;
    }
    let appender = tracing_appender::rolling::daily(dir, format!("{file_prefix}.log"));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init();
    Some(guard)
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
