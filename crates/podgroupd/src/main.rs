use anyhow::Context;
use anyhow::Result;
use api_types::PodGroupWithSpec;
use clap::Parser;
use podgroupd::app::ApplicationBuilder;
use podgroupd::config::Cli;
use podgroupd::config::Commands;
use podgroupd::config::DaemonArgs;
use podgroupd::config::OutputFormat;
use podgroupd::config::ShowGroupsArgs;
use podgroupd::infrastructure::store::pod_group_prefix;
use podgroupd::infrastructure::store::FileStore;
use podgroupd::infrastructure::store::Store;
use podgroupd::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowGroups(show_args) => run_show_groups(show_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_path.clone());

    tracing::info!("Starting podgroupd daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

/// Prints the persisted snapshots without starting any worker.
async fn run_show_groups(args: ShowGroupsArgs) -> Result<()> {
    let store = FileStore::new(args.store_dir.clone());
    let keys = store
        .keys_with_prefix(&pod_group_prefix(&args.store_root))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list pod groups: {e:?}"))?;

    let mut groups = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(bytes) = store
            .get(&key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read pod group {key}: {e:?}"))?
        else {
            continue;
        };
        let group: PodGroupWithSpec = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to decode pod group {key}"))?;
        if args
            .namespace
            .as_deref()
            .is_some_and(|namespace| namespace != group.spec.namespace)
        {
            continue;
        }
        groups.push(group);
    }

    let output = match args.format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(&groups).context("Failed to encode pod groups")?
        }
        OutputFormat::Yaml => serde_yaml::to_string(&groups).context("Failed to encode pod groups")?,
    };
    println!("{output}");
    Ok(())
}
