//! Owns every pod group controller of the daemon.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use api_types::PodGroupSpec;
use api_types::PodGroupWithSpec;
use api_types::PodSpec;
use api_types::RestartPolicy;
use error_stack::Report;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::podgroup::ControllerDeps;
use super::podgroup::PodGroupController;
use super::podgroup::PodGroupError;
use crate::infrastructure::cluster::Cluster;
use crate::infrastructure::eagle::EagleView;
use crate::infrastructure::store::pod_group_prefix;
use crate::infrastructure::store::Store;
use crate::infrastructure::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("pod group {0} already exists")]
    DuplicateGroup(GroupKey),

    #[error("pod group {0} not found")]
    UnknownGroup(GroupKey),

    #[error(transparent)]
    PodGroup(#[from] PodGroupError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub namespace: String,
    pub name: String,
}

impl GroupKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub struct PodGroupEngine {
    controllers: RwLock<HashMap<GroupKey, Arc<PodGroupController>>>,
    /// Worker of each known group; replaced along with its controller
    workers: Mutex<HashMap<GroupKey, JoinHandle<()>>>,
    cluster: Arc<dyn Cluster>,
    store: Arc<dyn Store>,
    eagle: Arc<EagleView>,
    deps: ControllerDeps,
    token: CancellationToken,
}

impl PodGroupEngine {
    pub fn new(cluster: Arc<dyn Cluster>, store: Arc<dyn Store>, deps: ControllerDeps) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            cluster,
            store,
            eagle: Arc::new(EagleView::new()),
            deps,
            token: CancellationToken::new(),
        }
    }

    pub fn deps(&self) -> &ControllerDeps {
        &self.deps
    }

    async fn activate(
        &self,
        key: &GroupKey,
        controller: &PodGroupController,
    ) -> Result<(), EngineError> {
        let handle = controller.activate(
            self.cluster.clone(),
            self.store.clone(),
            self.eagle.clone(),
            self.token.child_token(),
        )?;
        // the worker of a removed group stops after its purge
        self.workers.lock().await.insert(key.clone(), handle);
        Ok(())
    }

    async fn controller(&self, key: &GroupKey) -> Result<Arc<PodGroupController>, EngineError> {
        self.controllers
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownGroup(key.clone()))
    }

    pub async fn contains(&self, key: &GroupKey) -> bool {
        self.controllers.read().await.contains_key(key)
    }

    /// Creates, activates and deploys a new group.
    ///
    /// A removed group of the same name is replaced.
    pub async fn new_pod_group(&self, spec: PodGroupSpec) -> Result<(), EngineError> {
        let key = GroupKey::new(spec.namespace.clone(), spec.name.clone());
        let controller = {
            let mut controllers = self.controllers.write().await;
            if let Some(existing) = controllers.get(&key) {
                if !existing.is_removed().await {
                    return Err(EngineError::DuplicateGroup(key));
                }
            }
            let controller = Arc::new(PodGroupController::new(spec, self.deps.clone()));
            self.activate(&key, &controller).await?;
            controllers.insert(key.clone(), controller.clone());
            controller
        };
        info!(group = %key, "Pod group created");
        controller.deploy().await?;
        Ok(())
    }

    pub async fn remove_pod_group(&self, key: &GroupKey) -> Result<(), EngineError> {
        let controller = self.controller(key).await?;
        controller.remove().await?;
        Ok(())
    }

    pub async fn reschedule_instance(
        &self,
        key: &GroupKey,
        num_instances: usize,
        restart_policy: Option<RestartPolicy>,
    ) -> Result<(), EngineError> {
        let controller = self.controller(key).await?;
        controller
            .reschedule_instance(num_instances, restart_policy)
            .await?;
        Ok(())
    }

    pub async fn reschedule_spec(&self, key: &GroupKey, pod: PodSpec) -> Result<(), EngineError> {
        let controller = self.controller(key).await?;
        controller.reschedule_spec(pod).await?;
        Ok(())
    }

    /// Moves instances off `from`, for one group or for every group.
    pub async fn drift_node(
        &self,
        from: &str,
        to: Option<&str>,
        target: Option<(&GroupKey, Option<usize>)>,
        force: bool,
    ) -> Result<(), EngineError> {
        match target {
            Some((key, instance_no)) => {
                let controller = self.controller(key).await?;
                controller
                    .reschedule_drift(from, to, instance_no, force)
                    .await?;
            }
            None => {
                for controller in self.snapshot_controllers().await {
                    if let Err(e) = controller.reschedule_drift(from, to, None, force).await {
                        warn!(
                            namespace = %controller.namespace(),
                            name = %controller.name(),
                            error = %e,
                            "Drift failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Waits until the group's worker ran everything queued so far.
    pub async fn flush_pod_group(&self, key: &GroupKey) -> Result<(), EngineError> {
        self.controller(key).await?.flush().await?;
        Ok(())
    }

    pub async fn inspect_pod_group(&self, key: &GroupKey) -> Result<PodGroupWithSpec, EngineError> {
        Ok(self.controller(key).await?.inspect().await)
    }

    /// Snapshots of every group, ordered by key
    pub async fn list_pod_groups(&self) -> Vec<PodGroupWithSpec> {
        let mut controllers = self.snapshot_controllers().await;
        controllers.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
        let mut groups = Vec::with_capacity(controllers.len());
        for controller in controllers {
            groups.push(controller.inspect().await);
        }
        groups
    }

    async fn snapshot_controllers(&self) -> Vec<Arc<PodGroupController>> {
        self.controllers.read().await.values().cloned().collect()
    }

    /// Rebuilds controllers from the store and starts their workers.
    ///
    /// Entries that fail to decode are skipped. Returns the number of groups
    /// loaded.
    pub async fn load_from_store(&self) -> Result<usize, Report<StoreError>> {
        let prefix = pod_group_prefix(&self.deps.store_root);
        let keys = self.store.keys_with_prefix(&prefix).await?;

        let mut loaded = 0;
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let snapshot: PodGroupWithSpec = match serde_json::from_slice(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable pod group");
                    continue;
                }
            };

            let group_key = GroupKey::new(snapshot.spec.namespace.clone(), snapshot.spec.name.clone());
            if self.contains(&group_key).await {
                warn!(group = %group_key, "Pod group already loaded");
                continue;
            }

            let controller = Arc::new(PodGroupController::restore(snapshot, self.deps.clone()));
            if let Err(e) = self.activate(&group_key, &controller).await {
                error!(group = %group_key, error = %e, "Failed to activate restored pod group");
                continue;
            }
            // a group persisted mid-deploy is deployed again; running
            // containers of the same version are adopted
            if controller.is_pending().await {
                if let Err(e) = controller.deploy().await {
                    warn!(group = %group_key, error = %e, "Failed to resume deploy");
                }
            } else if !controller.reclaim_ports().await {
                warn!(group = %group_key, "Restored pod group without its stream ports");
            }
            self.controllers.write().await.insert(group_key, controller);
            loaded += 1;
        }

        info!(loaded = loaded, "Pod groups loaded from store");
        Ok(loaded)
    }

    /// Refreshes every group and forgets the ones removed since last time.
    pub async fn refresh_all(&self, force: bool) {
        let mut removed = Vec::new();
        for controller in self.snapshot_controllers().await {
            if controller.is_removed().await {
                removed.push(GroupKey::new(controller.namespace(), controller.name()));
                continue;
            }
            if let Err(e) = controller.refresh(force).await {
                warn!(
                    namespace = %controller.namespace(),
                    name = %controller.name(),
                    error = %e,
                    "Refresh failed"
                );
            }
        }

        if !removed.is_empty() {
            let mut controllers = self.controllers.write().await;
            let mut workers = self.workers.lock().await;
            for key in removed {
                info!(group = %key, "Forgetting removed pod group");
                controllers.remove(&key);
                workers.remove(&key);
            }
        }
    }

    /// Runs `is_healthy` on every group; returns the unhealthy ones.
    pub async fn check_health(&self) -> Vec<GroupKey> {
        let mut unhealthy = Vec::new();
        for controller in self.snapshot_controllers().await {
            if !controller.is_removed().await && !controller.is_healthy().await {
                unhealthy.push(GroupKey::new(controller.namespace(), controller.name()));
            }
        }
        unhealthy
    }

    /// Periodic reconciliation; every `force_every`th pass is forced.
    pub async fn run_refresh_loop(
        &self,
        interval: Duration,
        force_every: u64,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let mut passes: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    passes += 1;
                    let force = force_every > 0 && passes % force_every == 0;
                    self.refresh_all(force).await;
                    let unhealthy = self.check_health().await;
                    if !unhealthy.is_empty() {
                        warn!(unhealthy = unhealthy.len(), "Unhealthy pod groups found");
                    }
                }
                _ = token.cancelled() => {
                    info!("Refresh loop cancelled");
                    break;
                }
            }
        }
    }

    /// Stops every worker once its queue drained, waiting at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = handles.len();
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Pod group worker failed during shutdown: {e}");
                    }
                }
                info!(workers = count, "Pod group workers stopped");
            }
            Err(_) => warn!("Pod group workers did not stop within {:?}", timeout),
        }
    }
}
