pub mod cli;
pub mod daemon;
pub mod show;

use std::time::Duration;

/// Per-controller tunables passed from the daemon CLI to every pod group.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Capacity of each group's operation queue
    pub queue_capacity: usize,
    /// Interval between health polls of the preceding instance while pacing
    pub pacing_poll_interval: Duration,
    /// Polls before pacing gives up and proceeds
    pub pacing_retries: u32,
    /// Whether a drift forces the group snapshot timestamp
    pub drift_force_snapshot: bool,
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 500;
pub const DEFAULT_PACING_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PACING_RETRIES: u32 = 5;

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pacing_poll_interval: DEFAULT_PACING_POLL_INTERVAL,
            pacing_retries: DEFAULT_PACING_RETRIES,
            drift_force_snapshot: false,
        }
    }
}

impl From<&daemon::DaemonArgs> for ControllerSettings {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            queue_capacity: args.queue_capacity.max(1),
            pacing_poll_interval: Duration::from_secs(args.pacing_poll_interval_secs),
            pacing_retries: args.pacing_retries,
            drift_force_snapshot: args.drift_force_snapshot,
        }
    }
}

pub use cli::*;
pub use daemon::*;
pub use show::*;
