use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Parser, Clone, Debug)]
pub struct ShowGroupsArgs {
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

    #[arg(long, help = "Only show groups of this namespace")]
    pub namespace: Option<String>,

    #[arg(long, value_enum, default_value = "yaml", help = "Output format")]
    pub format: OutputFormat,
}
