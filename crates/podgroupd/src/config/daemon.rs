use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "PODGROUPD_STORE_DIR",
        default_value = "/var/lib/podgroupd",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the file store keeps pod group snapshots in"
    )]
    pub store_dir: PathBuf,

    #[arg(
        long,
        env = "PODGROUPD_STORE_ROOT",
        default_value = "/podgroupd",
        help = "Key prefix of every persisted pod group"
    )]
    pub store_root: String,

    #[arg(
        long,
        env = "PODGROUPD_NODES",
        value_delimiter = ',',
        default_value = "localhost",
        help = "Comma-separated node names the local runtime places instances on"
    )]
    pub nodes: Vec<String>,

    #[arg(
        long,
        env = "PODGROUPD_GROUPS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML list of pod group specs to ensure deployed at startup"
    )]
    pub groups_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds between two reconciliation passes over every group"
    )]
    pub refresh_interval_secs: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Every Nth reconciliation pass forces the group snapshot"
    )]
    pub force_refresh_every: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds pod group workers get to drain their queues on shutdown"
    )]
    pub shutdown_timeout_secs: u64,

    #[arg(
        long,
        default_value = "500",
        help = "Capacity of each pod group's operation queue"
    )]
    pub queue_capacity: usize,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between health polls while pacing upgrades and drifts"
    )]
    pub pacing_poll_interval_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Health polls before pacing proceeds with the next instance"
    )]
    pub pacing_retries: u32,

    #[arg(
        long,
        help = "Force the group snapshot after a drift",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub drift_force_snapshot: bool,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Log file path, logs go to stderr when unset"
    )]
    pub log_path: Option<String>,
}
