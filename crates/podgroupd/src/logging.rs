//! provides logging helpers

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

use crate::domain::podgroup::operation::OPS_TARGET;

/// initiate the global tracing subscriber
///
/// Operation log lines of the group workers go to stdout, everything else
/// goes to the fmt layer picked by `utils::logging`.
pub fn init(log_path: Option<String>) -> Option<WorkerGuard> {
    let (fmt_layer, guard) = utils::logging::get_fmt_layer(log_path);

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt_layer.with_filter(env_filter.and(filter::filter_fn(|metadata| {
        metadata.target() != OPS_TARGET
    })));

    let ops_layer = layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_filter(filter::filter_fn(|metadata| metadata.target() == OPS_TARGET));

    registry().with(fmt_layer).with(ops_layer).init();
    guard
}
