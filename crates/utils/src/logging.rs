//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable holding the log file path. Unset means stderr.
pub const LOG_PATH_ENV_VAR: &str = "PODGROUPD_LOG_PATH";

const DEFAULT_LOG_FILE: &str = "podgroupd.log";

/// A boxed fmt layer plus the guard that flushes its background writer.
pub type FmtLayer<S> = (
    Box<dyn Layer<S> + Send + Sync + 'static>,
    Option<WorkerGuard>,
);

/// Builds the fmt layer: stderr without a path, a daily rotated file otherwise.
///
/// The returned guard must be held for as long as logging is needed.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> FmtLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(log_path) = log_path.filter(|p| !p.trim().is_empty()) else {
        let layer = layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed();
        return (layer, None);
    };

    let path = Path::new(&log_path);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(7)
        .build(dir)
    {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (layer, Some(guard))
        }
        Err(e) => {
            eprintln!("failed to open log file {log_path}: {e}, logging to stderr");
            let layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed();
            (layer, None)
        }
    }
}
