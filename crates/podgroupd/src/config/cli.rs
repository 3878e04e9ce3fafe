use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::show::ShowGroupsArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pod group controller daemon
    Daemon(Box<DaemonArgs>),
    /// Print the pod groups persisted in the store
    #[command(name = "show-groups")]
    ShowGroups(ShowGroupsArgs),
}
