use std::time::Duration;

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// Running daemon: the pod group engine plus the tasks driving it
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Reconciles the restored groups until a shutdown signal arrives or a
    /// background task exits.
    pub async fn run(&self) -> Result<()> {
        let groups = self.services.engine.list_pod_groups().await.len();
        tracing::info!(
            groups = groups,
            refresh_interval_secs = self.daemon_args.refresh_interval_secs,
            "Reconciling pod groups"
        );

        let mut tasks = Tasks::new();
        tasks
            .spawn_all_tasks(self)
            .inspect_err(|e| tracing::error!("Failed to spawn background tasks: {e}"))?;
        tasks
            .wait_for_completion()
            .await
            .inspect_err(|e| tracing::error!("Background task failed: {e}"))?;

        tracing::info!("Reconciliation stopped");
        Ok(())
    }

    /// Lets every pod group worker finish its queued operations, bounded by
    /// `--shutdown-timeout-secs`.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.daemon_args.shutdown_timeout_secs);
        tracing::info!(timeout = ?timeout, "Draining pod group workers");

        self.services.engine.shutdown(timeout).await;

        tracing::info!("Pod group workers drained");
        Ok(())
    }
}
