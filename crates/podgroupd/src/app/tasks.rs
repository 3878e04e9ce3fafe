use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let refresh_task = self.spawn_refresh_task(app);
        self.tasks.push(refresh_task);

        let dependency_task = self.spawn_dependency_event_task(app);
        self.tasks.push(dependency_task);

        if let Some(notification_task) = self.spawn_notification_task(app) {
            self.tasks.push(notification_task);
        }

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();

                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_refresh_task(&self, app: &Application) -> JoinHandle<()> {
        let cli = app.daemon_args();
        let engine = app.services().engine.clone();
        let interval = Duration::from_secs(cli.refresh_interval_secs.max(1));
        let force_every = cli.force_refresh_every;
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting pod group refresh task");
            engine.run_refresh_loop(interval, force_every, token).await;
            tracing::info!("Pod group refresh task completed");
        })
    }

    /// Logs the placement changes pod groups publish for their dependents.
    fn spawn_dependency_event_task(&self, app: &Application) -> JoinHandle<()> {
        let mut events = app.services().publisher.subscribe();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting dependency event task");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            tracing::debug!(
                                event_type = ?event.event_type,
                                name = %event.name,
                                namespace = %event.namespace,
                                node_name = %event.node_name,
                                "Dependency event"
                            );
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped = skipped, "Dependency event consumer lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            tracing::info!("Dependency event task completed");
        })
    }

    fn spawn_notification_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let Some(mut notifications) = app.services().take_notifications() else {
            tracing::warn!("Notification receiver already taken");
            return None;
        };
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting notification task");
            loop {
                tokio::select! {
                    notification = notifications.recv() => match notification {
                        Some(notification) => {
                            tracing::warn!(
                                kind = ?notification.kind,
                                namespace = %notification.namespace,
                                name = %notification.name,
                                instance_no = notification.instance_no,
                                timestamp = %notification.timestamp,
                                "Pod group notification"
                            );
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            tracing::info!("Notification task completed");
        }))
    }
}
