//! Units of work drained by a pod group's worker.

use std::fmt;
use std::sync::Arc;

use api_types::PodGroupSpec;
use api_types::PodGroupWithSpec;
use api_types::PodSpec;
use api_types::RunState;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::controller::ControllerShared;
use super::pod_controller::InstanceContext;
use super::pod_controller::PodController;
use crate::infrastructure::cluster::Cluster;
use crate::infrastructure::eagle::EagleView;
use crate::infrastructure::publisher::Publisher;
use crate::infrastructure::store::Store;

/// Target of the operation journal
pub const OPS_TARGET: &str = "ops";

/// One step of an intent's plan.
///
/// Instance operations carry the group spec that was current when they were
/// enqueued, so a later spec change never alters an operation already queued.
#[derive(Debug)]
pub enum Operation {
    Log {
        message: String,
    },
    SaveStore {
        force: bool,
    },
    RemoveStore,
    SnapshotEagleView,
    DeployInstance {
        instance_no: usize,
        spec: Arc<PodGroupSpec>,
    },
    UpgradeInstance {
        instance_no: usize,
        old: PodSpec,
        spec: Arc<PodGroupSpec>,
    },
    DriftInstance {
        instance_no: usize,
        from: String,
        to: Option<String>,
        force: bool,
        spec: Arc<PodGroupSpec>,
    },
    RemoveInstance {
        instance_no: usize,
        spec: Arc<PodGroupSpec>,
    },
    RefreshInstance {
        instance_no: usize,
        spec: Arc<PodGroupSpec>,
    },
    VerifyInstanceCount {
        spec: Arc<PodGroupSpec>,
    },
    PushPodCtrl {
        pod: PodSpec,
    },
    PopPodCtrl,
    SnapshotGroup {
        force: bool,
    },
    SnapshotPrevState,
    /// Marks the group removed and stops the worker
    Purge,
    /// Completes once every operation queued before it ran
    Fence {
        done: oneshot::Sender<()>,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Log { .. } => "log",
            Operation::SaveStore { .. } => "save_store",
            Operation::RemoveStore => "remove_store",
            Operation::SnapshotEagleView => "snapshot_eagle_view",
            Operation::DeployInstance { .. } => "deploy_instance",
            Operation::UpgradeInstance { .. } => "upgrade_instance",
            Operation::DriftInstance { .. } => "drift_instance",
            Operation::RemoveInstance { .. } => "remove_instance",
            Operation::RefreshInstance { .. } => "refresh_instance",
            Operation::VerifyInstanceCount { .. } => "verify_instance_count",
            Operation::PushPodCtrl { .. } => "push_pod_ctrl",
            Operation::PopPodCtrl => "pop_pod_ctrl",
            Operation::SnapshotGroup { .. } => "snapshot_group",
            Operation::SnapshotPrevState => "snapshot_prev_state",
            Operation::Purge => "purge",
            Operation::Fence { .. } => "fence",
        }
    }

    pub fn instance_no(&self) -> Option<usize> {
        match self {
            Operation::DeployInstance { instance_no, .. }
            | Operation::UpgradeInstance { instance_no, .. }
            | Operation::DriftInstance { instance_no, .. }
            | Operation::RemoveInstance { instance_no, .. }
            | Operation::RefreshInstance { instance_no, .. } => Some(*instance_no),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance_no() {
            Some(instance_no) => write!(f, "{} #{instance_no}", self.kind()),
            None => f.write_str(self.kind()),
        }
    }
}

/// What the worker does after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Collaborators an operation runs against.
pub struct WorkerContext {
    pub(crate) shared: Arc<ControllerShared>,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) eagle: Arc<EagleView>,
    pub(crate) publisher: Publisher,
}

impl WorkerContext {
    fn instance_context<'a>(&'a self, spec: &'a PodGroupSpec) -> InstanceContext<'a> {
        InstanceContext {
            cluster: self.cluster.as_ref(),
            publisher: &self.publisher,
            namespace: &spec.namespace,
            name: &spec.name,
            dependencies: spec.dependencies(),
            restart_policy: spec.restart_policy,
        }
    }

    /// Detached copy of one instance; no lock is held while it is driven.
    async fn checkout(&self, instance_no: usize) -> Option<PodController> {
        let state = self.shared.state.read().await;
        let ctrl = state
            .pod_ctrls
            .iter()
            .find(|ctrl| ctrl.instance_no() == instance_no)
            .cloned();
        if ctrl.is_none() {
            warn!(
                namespace = %self.shared.namespace,
                name = %self.shared.name,
                instance_no = instance_no,
                "No pod controller for instance"
            );
        }
        ctrl
    }

    async fn checkin(&self, ctrl: PodController) {
        let mut state = self.shared.state.write().await;
        if let Some(slot) = state
            .pod_ctrls
            .iter_mut()
            .find(|slot| slot.instance_no() == ctrl.instance_no())
        {
            *slot = ctrl;
        }
    }

    async fn known_containers(&self) -> Vec<api_types::RuntimeEaglePod> {
        self.shared.state.read().await.known_containers.clone()
    }

    async fn deploy_instance(&self, instance_no: usize, spec: &PodGroupSpec) {
        let known = self.known_containers().await;
        if let Some(mut ctrl) = self.checkout(instance_no).await {
            ctrl.deploy(&self.instance_context(spec), spec.version, &known)
                .await;
            self.checkin(ctrl).await;
        }
    }

    async fn remove_instance(&self, instance_no: usize, spec: &PodGroupSpec) {
        let known = self.known_containers().await;
        if let Some(mut ctrl) = self.checkout(instance_no).await {
            ctrl.remove(&self.instance_context(spec), &known).await;
            self.checkin(ctrl).await;
        }
    }

    async fn push_pod_ctrl(&self, pod: PodSpec) -> usize {
        let mut state = self.shared.state.write().await;
        let instance_no = state.pod_ctrls.len() + 1;
        state.pod_ctrls.push(PodController::new(pod, instance_no));
        instance_no
    }

    async fn pop_pod_ctrl(&self) {
        let mut state = self.shared.state.write().await;
        if let Some(ctrl) = state.pod_ctrls.pop() {
            debug!(
                namespace = %self.shared.namespace,
                name = %self.shared.name,
                instance_no = ctrl.instance_no(),
                "Pod controller dropped"
            );
        }
    }

    async fn verify_instance_count(&self, spec: &PodGroupSpec) {
        let desired = spec.num_instances;
        for stray in self
            .known_containers()
            .await
            .iter()
            .filter(|c| c.instance_no > desired)
        {
            info!(
                namespace = %spec.namespace,
                name = %spec.name,
                instance_no = stray.instance_no,
                container_id = %stray.container_id,
                "Removing container beyond desired instance count"
            );
            if let Err(report) = self.cluster.remove(&stray.container_id).await {
                warn!(container_id = %stray.container_id, error = ?report, "Failed to remove stray container");
            }
        }

        let current = self.shared.state.read().await.pod_ctrls.len();
        if current < desired {
            for _ in current..desired {
                let instance_no = self.push_pod_ctrl(spec.pod.clone()).await;
                self.deploy_instance(instance_no, spec).await;
            }
        } else {
            for instance_no in (desired + 1..=current).rev() {
                self.remove_instance(instance_no, spec).await;
                self.pop_pod_ctrl().await;
            }
        }
    }

    async fn snapshot_eagle_view(&self) {
        let (namespace, name) = (&self.shared.namespace, &self.shared.name);
        match self
            .eagle
            .refresh_group(self.cluster.as_ref(), namespace, name)
            .await
        {
            Ok(containers) => {
                self.shared.state.write().await.known_containers = containers;
            }
            Err(report) => {
                warn!(namespace = %namespace, name = %name, error = ?report, "Failed to refresh placement view");
            }
        }
    }

    async fn snapshot_group(&self, force: bool) {
        let mut state = self.shared.state.write().await;
        let pods: Vec<_> = state.pod_ctrls.iter().map(|ctrl| ctrl.pod.clone()).collect();

        let (run_state, last_error) =
            if let Some(failed) = pods.iter().find(|pod| pod.state == RunState::Fail) {
                (RunState::Fail, failed.last_error.clone())
            } else if pods.iter().any(|pod| pod.state == RunState::Pending) {
                (RunState::Pending, String::new())
            } else {
                (RunState::Success, String::new())
            };

        let changed = state.group.pods != pods
            || state.group.state != run_state
            || state.group.last_error != last_error;
        state.group.pods = pods;
        state.group.state = run_state;
        state.group.last_error = last_error;
        if force || changed {
            state.group.updated_at = Some(Utc::now());
        }
    }

    async fn snapshot_prev_state(&self) {
        let mut state = self.shared.state.write().await;
        for ctrl in state.pod_ctrls.iter_mut() {
            ctrl.record_prev_state();
        }
        state.prev_state = state
            .pod_ctrls
            .iter()
            .map(|ctrl| ctrl.spec.prev_state.clone())
            .collect();
    }

    async fn save_store(&self, force: bool) {
        let snapshot = {
            let state = self.shared.state.read().await;
            PodGroupWithSpec {
                spec: state.spec.as_ref().clone(),
                prev_state: state.prev_state.clone(),
                group: state.group.clone(),
            }
        };
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %self.shared.store_key, error = %e, "Failed to encode pod group");
                return;
            }
        };

        let mut last_saved = self.shared.last_saved.lock().await;
        if !force && last_saved.as_deref() == Some(bytes.as_slice()) {
            debug!(key = %self.shared.store_key, "Pod group unchanged, skipping save");
            return;
        }
        match self.store.save(&self.shared.store_key, &bytes).await {
            Ok(()) => *last_saved = Some(bytes),
            Err(report) => {
                warn!(key = %self.shared.store_key, error = ?report, "Failed to save pod group");
            }
        }
    }

    async fn remove_store(&self) {
        let mut last_saved = self.shared.last_saved.lock().await;
        match self.store.remove(&self.shared.store_key).await {
            Ok(()) => *last_saved = None,
            Err(report) => {
                warn!(key = %self.shared.store_key, error = ?report, "Failed to remove pod group from store");
            }
        }
    }

    async fn purge(&self) {
        {
            let mut state = self.shared.state.write().await;
            let pods = state.pod_ctrls.drain(..).map(|ctrl| ctrl.pod).collect();
            state.group.pods = pods;
            state.group.state = RunState::Removed;
            state.group.updated_at = Some(Utc::now());
            state.known_containers.clear();
        }
        self.eagle
            .forget_group(&self.shared.namespace, &self.shared.name)
            .await;
    }
}

impl Operation {
    pub(crate) async fn execute(self, ctx: &WorkerContext) -> Flow {
        match self {
            Operation::Log { message } => {
                info!(
                    target: OPS_TARGET,
                    namespace = %ctx.shared.namespace,
                    name = %ctx.shared.name,
                    "{message}"
                );
            }
            Operation::SaveStore { force } => ctx.save_store(force).await,
            Operation::RemoveStore => ctx.remove_store().await,
            Operation::SnapshotEagleView => ctx.snapshot_eagle_view().await,
            Operation::DeployInstance { instance_no, spec } => {
                ctx.deploy_instance(instance_no, &spec).await;
            }
            Operation::UpgradeInstance {
                instance_no,
                old,
                spec,
            } => {
                if let Some(mut ctrl) = ctx.checkout(instance_no).await {
                    debug!(
                        namespace = %spec.namespace,
                        name = %spec.name,
                        instance_no = instance_no,
                        from = old.version,
                        to = spec.pod.version,
                        "Upgrading instance"
                    );
                    ctrl.upgrade(&ctx.instance_context(&spec), spec.version, &spec.pod)
                        .await;
                    ctx.checkin(ctrl).await;
                }
            }
            Operation::DriftInstance {
                instance_no,
                from,
                to,
                force,
                spec,
            } => {
                if let Some(mut ctrl) = ctx.checkout(instance_no).await {
                    ctrl.drift(&ctx.instance_context(&spec), &from, to.as_deref(), force)
                        .await;
                    ctx.checkin(ctrl).await;
                }
            }
            Operation::RemoveInstance { instance_no, spec } => {
                ctx.remove_instance(instance_no, &spec).await;
            }
            Operation::RefreshInstance { instance_no, spec } => {
                if let Some(mut ctrl) = ctx.checkout(instance_no).await {
                    ctrl.refresh(&ctx.instance_context(&spec), spec.version)
                        .await;
                    ctx.checkin(ctrl).await;
                }
            }
            Operation::VerifyInstanceCount { spec } => ctx.verify_instance_count(&spec).await,
            Operation::PushPodCtrl { pod } => {
                ctx.push_pod_ctrl(pod).await;
            }
            Operation::PopPodCtrl => ctx.pop_pod_ctrl().await,
            Operation::SnapshotGroup { force } => ctx.snapshot_group(force).await,
            Operation::SnapshotPrevState => ctx.snapshot_prev_state().await,
            Operation::Purge => {
                ctx.purge().await;
                return Flow::Stop;
            }
            Operation::Fence { done } => {
                let _ = done.send(());
            }
        }
        Flow::Continue
    }
}
