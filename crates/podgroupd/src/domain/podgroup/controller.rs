//! Pod group controller: turns intents into ordered operation plans and owns
//! the worker that drains them.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::HealthState;
use api_types::NotifyKind;
use api_types::NotifySpec;
use api_types::PodGroup;
use api_types::PodGroupSpec;
use api_types::PodGroupWithSpec;
use api_types::PodPrevState;
use api_types::PodSpec;
use api_types::RestartPolicy;
use api_types::RunState;
use api_types::RuntimeEaglePod;
use api_types::StreamProc;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::error::PodGroupError;
use super::operation::Flow;
use super::operation::Operation;
use super::operation::WorkerContext;
use super::pod_controller::PodController;
use super::port_diff::diff_ports;
use super::port_diff::stream_procs;
use crate::config::ControllerSettings;
use crate::domain::port_registry::PortRegistry;
use crate::infrastructure::cluster::Cluster;
use crate::infrastructure::eagle::EagleView;
use crate::infrastructure::notify::NotificationSink;
use crate::infrastructure::publisher::Publisher;
use crate::infrastructure::store::pod_group_key;
use crate::infrastructure::store::Store;

/// Shared collaborators every controller of a daemon is built with.
#[derive(Clone)]
pub struct ControllerDeps {
    pub port_registry: Arc<PortRegistry>,
    pub publisher: Publisher,
    pub notifier: Arc<dyn NotificationSink>,
    pub settings: ControllerSettings,
    /// Store key prefix
    pub store_root: String,
}

pub(crate) struct ControllerState {
    pub(crate) spec: Arc<PodGroupSpec>,
    pub(crate) prev_state: Vec<PodPrevState>,
    pub(crate) group: PodGroup,
    pub(crate) pod_ctrls: Vec<PodController>,
    /// Containers the placement view reported at the last snapshot
    pub(crate) known_containers: Vec<RuntimeEaglePod>,
    /// Set once a removal is queued
    pub(crate) removing: bool,
}

/// State shared between the controller and its worker.
pub(crate) struct ControllerShared {
    pub(crate) namespace: String,
    pub(crate) name: String,
    pub(crate) store_key: String,
    pub(crate) state: RwLock<ControllerState>,
    /// Bytes of the last successful save
    pub(crate) last_saved: tokio::sync::Mutex<Option<Vec<u8>>>,
}

pub struct PodGroupController {
    shared: Arc<ControllerShared>,
    ops_tx: mpsc::Sender<Operation>,
    ops_rx: Mutex<Option<mpsc::Receiver<Operation>>>,
    deps: ControllerDeps,
}

impl PodGroupController {
    /// Builds a controller for a fresh group with one slot per desired instance.
    pub fn new(spec: PodGroupSpec, deps: ControllerDeps) -> Self {
        let pod_ctrls = (1..=spec.num_instances)
            .map(|instance_no| PodController::new(spec.pod.clone(), instance_no))
            .collect();
        let group = PodGroup::new(spec.namespace.clone(), spec.name.clone());
        Self::with_state(spec, Vec::new(), group, pod_ctrls, deps)
    }

    /// Rebuilds a controller from its persisted snapshot.
    pub fn restore(snapshot: PodGroupWithSpec, deps: ControllerDeps) -> Self {
        let PodGroupWithSpec {
            spec,
            prev_state,
            group,
        } = snapshot;
        let pod_ctrls = (1..=spec.num_instances)
            .map(|instance_no| {
                let mut pod_spec = spec.pod.clone();
                if let Some(prev) = prev_state.get(instance_no - 1) {
                    pod_spec.prev_state = prev.clone();
                }
                let mut ctrl = PodController::new(pod_spec, instance_no);
                if let Some(pod) = group.pods.iter().find(|p| p.instance_no == instance_no) {
                    ctrl.pod = pod.clone();
                }
                ctrl
            })
            .collect();
        Self::with_state(spec, prev_state, group, pod_ctrls, deps)
    }

    fn with_state(
        spec: PodGroupSpec,
        prev_state: Vec<PodPrevState>,
        group: PodGroup,
        pod_ctrls: Vec<PodController>,
        deps: ControllerDeps,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(deps.settings.queue_capacity.max(1));
        let shared = ControllerShared {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            store_key: pod_group_key(&deps.store_root, &spec.namespace, &spec.name),
            state: RwLock::new(ControllerState {
                spec: Arc::new(spec),
                prev_state,
                group,
                pod_ctrls,
                known_containers: Vec::new(),
                removing: false,
            }),
            last_saved: tokio::sync::Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            ops_tx,
            ops_rx: Mutex::new(Some(ops_rx)),
            deps,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn store_key(&self) -> &str {
        &self.shared.store_key
    }

    /// The installed spec; replaced as a whole on every change.
    pub async fn spec(&self) -> Arc<PodGroupSpec> {
        self.shared.state.read().await.spec.clone()
    }

    /// Operations queued and not yet picked up by the worker
    pub fn pending_operations(&self) -> usize {
        self.ops_tx.max_capacity() - self.ops_tx.capacity()
    }

    /// Spawns the worker draining this group's queue.
    ///
    /// A cancelled `token` stops the worker only once the queue is empty.
    pub fn activate(
        &self,
        cluster: Arc<dyn Cluster>,
        store: Arc<dyn Store>,
        eagle: Arc<EagleView>,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, PodGroupError> {
        let receiver = self
            .ops_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PodGroupError::AlreadyActivated {
                namespace: self.shared.namespace.clone(),
                name: self.shared.name.clone(),
            })?;

        let ctx = WorkerContext {
            shared: self.shared.clone(),
            cluster,
            store,
            eagle,
            publisher: self.deps.publisher.clone(),
        };
        Ok(tokio::spawn(run_worker(ctx, receiver, token)))
    }

    /// Waits until every operation queued before this call has run.
    pub async fn flush(&self) -> Result<(), PodGroupError> {
        let (done, finished) = oneshot::channel();
        self.enqueue(vec![Operation::Fence { done }]).await?;
        finished.await.map_err(|_| self.queue_closed())
    }

    fn queue_closed(&self) -> PodGroupError {
        PodGroupError::QueueClosed {
            namespace: self.shared.namespace.clone(),
            name: self.shared.name.clone(),
        }
    }

    async fn enqueue(&self, ops: Vec<Operation>) -> Result<(), PodGroupError> {
        for op in ops {
            self.ops_tx
                .send(op)
                .await
                .map_err(|_| self.queue_closed())?;
        }
        Ok(())
    }

    fn log_op(&self, message: impl Into<String>) -> Operation {
        Operation::Log {
            message: message.into(),
        }
    }

    /// Whether the group is removed or a removal is already queued.
    async fn terminating(&self, intent: &str) -> bool {
        let state = self.shared.state.read().await;
        let terminating = state.removing || state.group.state == RunState::Removed;
        if terminating {
            info!(
                namespace = %self.shared.namespace,
                name = %self.shared.name,
                intent = intent,
                "Pod group is being removed, ignoring intent"
            );
        }
        terminating
    }

    async fn install_spec(&self, spec: PodGroupSpec) -> Arc<PodGroupSpec> {
        let spec = Arc::new(spec);
        self.shared.state.write().await.spec = spec.clone();
        spec
    }

    async fn mark_port_conflict(&self, conflicts: &[StreamProc]) {
        let ports = conflicts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let error = PodGroupError::PortConflict { ports };
        warn!(
            namespace = %self.shared.namespace,
            name = %self.shared.name,
            error = %error,
            "Stream port conflict"
        );

        let mut state = self.shared.state.write().await;
        state.group.state = RunState::Fail;
        state.group.last_error = error.to_string();
        state.group.updated_at = Some(Utc::now());
    }

    /// The ports `pod` declares, owned by this group.
    fn group_procs(&self, pod: &PodSpec) -> Result<Vec<StreamProc>, serde_json::Error> {
        stream_procs(pod, &self.shared.namespace, &self.shared.name)
    }

    async fn clear_last_error(&self) {
        self.shared.state.write().await.group.last_error.clear();
    }

    fn malformed(&self, pod: &PodSpec, source: serde_json::Error) {
        let error = PodGroupError::MalformedAnnotation {
            pod: pod.name.clone(),
            source,
        };
        warn!(
            namespace = %self.shared.namespace,
            name = %self.shared.name,
            error = %error,
            "Cannot decode declared stream ports"
        );
    }

    /// Binds the installed template's ports again after a restart.
    ///
    /// Returns false when the ports could not be bound.
    pub async fn reclaim_ports(&self) -> bool {
        let spec = self.spec().await;
        let procs = match self.group_procs(&spec.pod) {
            Ok(procs) => procs,
            Err(e) => {
                self.malformed(&spec.pod, e);
                return false;
            }
        };
        match self.deps.port_registry.register(&procs) {
            Ok(()) => true,
            Err(conflicts) => {
                self.mark_port_conflict(&conflicts).await;
                false
            }
        }
    }

    /// Deploys every instance of the installed spec.
    pub async fn deploy(&self) -> Result<(), PodGroupError> {
        if self.terminating("deploy").await {
            return Ok(());
        }
        let spec = self.spec().await;
        let procs = match self.group_procs(&spec.pod) {
            Ok(procs) => procs,
            Err(e) => {
                self.malformed(&spec.pod, e);
                return Ok(());
            }
        };
        self.clear_last_error().await;
        if let Err(conflicts) = self.deps.port_registry.register(&procs) {
            self.mark_port_conflict(&conflicts).await;
            return Ok(());
        }

        let mut ops = vec![
            self.log_op(format!("deploy {spec} start")),
            Operation::SaveStore { force: true },
            Operation::SnapshotEagleView,
        ];
        ops.extend(
            (1..=spec.num_instances).map(|instance_no| Operation::DeployInstance {
                instance_no,
                spec: spec.clone(),
            }),
        );
        ops.extend([
            Operation::SnapshotGroup { force: true },
            Operation::SnapshotPrevState,
            Operation::SaveStore { force: true },
            self.log_op(format!("deploy {spec} end")),
        ]);
        self.enqueue(ops).await
    }

    /// Changes the instance count and, optionally, the restart policy.
    pub async fn reschedule_instance(
        &self,
        num_instances: usize,
        restart_policy: Option<RestartPolicy>,
    ) -> Result<(), PodGroupError> {
        if self.terminating("reschedule_instance").await {
            return Ok(());
        }
        let current = self.spec().await;
        let restart_policy = restart_policy.unwrap_or(current.restart_policy);
        if num_instances == current.num_instances && restart_policy == current.restart_policy {
            debug!(
                namespace = %self.shared.namespace,
                name = %self.shared.name,
                "Instance count and restart policy unchanged"
            );
            return Ok(());
        }

        let spec = self
            .install_spec(PodGroupSpec {
                num_instances,
                restart_policy,
                updated_at: Utc::now(),
                ..current.as_ref().clone()
            })
            .await;

        let from = current.num_instances;
        let mut ops = vec![
            self.log_op(format!(
                "reschedule instance {}/{} x{from} -> x{num_instances} ({restart_policy}) start",
                spec.namespace, spec.name
            )),
            Operation::SaveStore { force: true },
        ];
        if num_instances != from {
            ops.push(Operation::SnapshotEagleView);
            if num_instances > from {
                for instance_no in from + 1..=num_instances {
                    ops.push(Operation::PushPodCtrl {
                        pod: spec.pod.clone(),
                    });
                    ops.push(Operation::DeployInstance {
                        instance_no,
                        spec: spec.clone(),
                    });
                }
            } else {
                for instance_no in (num_instances + 1..=from).rev() {
                    ops.push(Operation::RemoveInstance {
                        instance_no,
                        spec: spec.clone(),
                    });
                    ops.push(Operation::PopPodCtrl);
                }
            }
        }
        ops.extend([
            Operation::SnapshotGroup { force: true },
            Operation::SnapshotPrevState,
            Operation::SaveStore { force: true },
            self.log_op(format!(
                "reschedule instance {}/{} end",
                spec.namespace, spec.name
            )),
        ]);
        self.enqueue(ops).await
    }

    /// Upgrades every instance to a new template, one at a time.
    pub async fn reschedule_spec(&self, pod: PodSpec) -> Result<(), PodGroupError> {
        if self.terminating("reschedule_spec").await {
            return Ok(());
        }
        let current = self.spec().await;
        if current.pod.template_eq(&pod) {
            debug!(
                namespace = %self.shared.namespace,
                name = %self.shared.name,
                "Pod template unchanged"
            );
            return Ok(());
        }

        let diff = match diff_ports(
            &current.pod,
            &pod,
            &self.shared.namespace,
            &self.shared.name,
        ) {
            Ok(diff) => diff,
            Err(e) => {
                self.malformed(&pod, e);
                return Ok(());
            }
        };
        self.clear_last_error().await;
        if let Err(conflicts) = self.deps.port_registry.register(&diff.fresh) {
            self.mark_port_conflict(&conflicts).await;
            return Ok(());
        }

        let spec = self
            .install_spec(PodGroupSpec {
                pod: current.pod.merge(&pod),
                version: current.version + 1,
                updated_at: Utc::now(),
                ..current.as_ref().clone()
            })
            .await;
        self.deps.port_registry.cancel(&diff.dated);
        self.deps.port_registry.update(&diff.updated);

        self.enqueue(vec![
            self.log_op(format!("reschedule spec {spec} start")),
            Operation::SaveStore { force: true },
        ])
        .await?;
        for instance_no in 1..=spec.num_instances {
            if instance_no > 1 {
                self.pace(instance_no - 1).await;
                if self.terminating("reschedule_spec").await {
                    return Ok(());
                }
            }
            self.enqueue(vec![Operation::UpgradeInstance {
                instance_no,
                old: current.pod.clone(),
                spec: spec.clone(),
            }])
            .await?;
        }
        self.enqueue(vec![
            Operation::SnapshotGroup { force: true },
            Operation::SnapshotPrevState,
            Operation::SaveStore { force: true },
            self.log_op(format!("reschedule spec {spec} end")),
        ])
        .await
    }

    /// Moves instances off `from`. `None` for `instance_no` moves every instance.
    pub async fn reschedule_drift(
        &self,
        from: &str,
        to: Option<&str>,
        instance_no: Option<usize>,
        force: bool,
    ) -> Result<(), PodGroupError> {
        if self.terminating("reschedule_drift").await {
            return Ok(());
        }
        let spec = self.spec().await;
        if spec.num_instances == 0 {
            debug!(
                namespace = %self.shared.namespace,
                name = %self.shared.name,
                "No instances to drift"
            );
            return Ok(());
        }
        let targets: Vec<usize> = match instance_no {
            None => (1..=spec.num_instances).collect(),
            Some(n) if (1..=spec.num_instances).contains(&n) => vec![n],
            Some(n) => {
                warn!(
                    namespace = %self.shared.namespace,
                    name = %self.shared.name,
                    instance_no = n,
                    "Drift target instance does not exist"
                );
                return Ok(());
            }
        };

        let target_node = to.unwrap_or("any");
        self.enqueue(vec![self.log_op(format!(
            "drift {spec} {from} -> {target_node} start"
        ))])
        .await?;
        for (i, instance_no) in targets.iter().copied().enumerate() {
            if i > 0 {
                self.pace(instance_no - 1).await;
                if self.terminating("reschedule_drift").await {
                    return Ok(());
                }
            }
            self.enqueue(vec![Operation::DriftInstance {
                instance_no,
                from: from.to_string(),
                to: to.map(str::to_string),
                force,
                spec: spec.clone(),
            }])
            .await?;
        }
        self.enqueue(vec![
            Operation::SnapshotGroup {
                force: self.deps.settings.drift_force_snapshot,
            },
            Operation::SnapshotPrevState,
            Operation::SaveStore { force: false },
            self.log_op(format!("drift {spec} {from} -> {target_node} end")),
        ])
        .await
    }

    /// Releases the group's ports and tears every instance down.
    pub async fn remove(&self) -> Result<(), PodGroupError> {
        let spec = {
            let mut state = self.shared.state.write().await;
            if state.removing || state.group.state == RunState::Removed {
                info!(
                    namespace = %self.shared.namespace,
                    name = %self.shared.name,
                    "Pod group removal already queued"
                );
                return Ok(());
            }
            state.removing = true;
            state.spec.clone()
        };

        match self.group_procs(&spec.pod) {
            Ok(procs) => self.deps.port_registry.cancel(&procs),
            Err(e) => self.malformed(&spec.pod, e),
        }

        let mut ops = vec![
            self.log_op(format!("remove {spec} start")),
            Operation::RemoveStore,
        ];
        ops.extend(
            (1..=spec.num_instances).map(|instance_no| Operation::RemoveInstance {
                instance_no,
                spec: spec.clone(),
            }),
        );
        ops.extend([
            Operation::SnapshotEagleView,
            self.log_op(format!("remove {spec} end")),
            Operation::Purge,
        ]);
        self.enqueue(ops).await
    }

    /// Reconciles every instance against the installed spec.
    pub async fn refresh(&self, force: bool) -> Result<(), PodGroupError> {
        let spec = {
            let state = self.shared.state.read().await;
            if state.removing || matches!(state.group.state, RunState::Removed | RunState::Pending) {
                debug!(
                    namespace = %self.shared.namespace,
                    name = %self.shared.name,
                    state = %state.group.state,
                    "Skipping refresh"
                );
                return Ok(());
            }
            state.spec.clone()
        };

        let mut ops = vec![
            self.log_op(format!("refresh {spec} start")),
            Operation::SnapshotEagleView,
        ];
        ops.extend(
            (1..=spec.num_instances).map(|instance_no| Operation::RefreshInstance {
                instance_no,
                spec: spec.clone(),
            }),
        );
        ops.extend([
            Operation::VerifyInstanceCount { spec: spec.clone() },
            Operation::SnapshotGroup { force },
            Operation::SnapshotPrevState,
            Operation::SaveStore { force: false },
            self.log_op(format!("refresh {spec} end")),
        ]);
        self.enqueue(ops).await
    }

    /// Point-in-time copy of spec, previous state and observed group.
    pub async fn inspect(&self) -> PodGroupWithSpec {
        let state = self.shared.state.read().await;
        PodGroupWithSpec {
            spec: state.spec.as_ref().clone(),
            prev_state: state.prev_state.clone(),
            group: state.group.clone(),
        }
    }

    /// False when an instance marked running has lost its address.
    ///
    /// Notifies once for the first such instance found.
    pub async fn is_healthy(&self) -> bool {
        let state = self.shared.state.read().await;
        for ctrl in &state.pod_ctrls {
            if ctrl.pod.pod_ip().is_empty() && ctrl.pod.state == RunState::Success {
                warn!(
                    namespace = %self.shared.namespace,
                    name = %self.shared.name,
                    instance_no = ctrl.instance_no(),
                    "Instance lost its address"
                );
                self.deps.notifier.notify(NotifySpec::new(
                    NotifyKind::PodIpLost,
                    self.shared.namespace.clone(),
                    self.shared.name.clone(),
                    ctrl.instance_no(),
                ));
                return false;
            }
        }
        true
    }

    pub async fn is_removed(&self) -> bool {
        self.shared.state.read().await.group.state == RunState::Removed
    }

    pub async fn is_pending(&self) -> bool {
        self.shared.state.read().await.group.state == RunState::Pending
    }

    async fn instance_health(&self, instance_no: usize) -> Option<(HealthState, PodSpec)> {
        let state = self.shared.state.read().await;
        state
            .pod_ctrls
            .iter()
            .find(|ctrl| ctrl.instance_no() == instance_no)
            .map(|ctrl| (ctrl.health(), ctrl.spec.clone()))
    }

    /// Holds the caller until the preceding instance settled.
    ///
    /// Without any health result it waits the template's setup time, otherwise
    /// it polls a bounded number of times while the instance is starting.
    async fn pace(&self, preceding: usize) {
        let setup_time = match self.instance_health(preceding).await {
            None => return,
            Some((HealthState::None, pod)) => pod.setup_time(),
            Some(_) => {
                let settings = &self.deps.settings;
                for _ in 0..settings.pacing_retries {
                    match self.instance_health(preceding).await {
                        Some((HealthState::Starting, _)) => {
                            tokio::time::sleep(settings.pacing_poll_interval).await;
                        }
                        _ => return,
                    }
                }
                debug!(
                    namespace = %self.shared.namespace,
                    name = %self.shared.name,
                    instance_no = preceding,
                    "Instance still starting, proceeding anyway"
                );
                return;
            }
        };
        debug!(
            namespace = %self.shared.namespace,
            name = %self.shared.name,
            instance_no = preceding,
            setup_time = ?setup_time,
            "Waiting setup time of preceding instance"
        );
        tokio::time::sleep(setup_time).await;
    }

    #[cfg(test)]
    pub(crate) fn drain_queued(&self) -> Vec<Operation> {
        let mut guard = self.ops_rx.lock().unwrap();
        let mut ops = Vec::new();
        if let Some(receiver) = guard.as_mut() {
            while let Ok(op) = receiver.try_recv() {
                ops.push(op);
            }
        }
        ops
    }

    #[cfg(test)]
    pub(crate) async fn set_group_state(&self, run_state: RunState) {
        self.shared.state.write().await.group.state = run_state;
    }

    #[cfg(test)]
    pub(crate) async fn with_pod_ctrls<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<PodController>),
    {
        f(&mut self.shared.state.write().await.pod_ctrls);
    }
}

#[tracing::instrument(
    name = "pod_group_worker",
    skip_all,
    fields(namespace = %ctx.shared.namespace, name = %ctx.shared.name)
)]
async fn run_worker(
    ctx: WorkerContext,
    mut receiver: mpsc::Receiver<Operation>,
    token: CancellationToken,
) {
    info!("Operation worker started");
    loop {
        tokio::select! {
            biased;
            op = receiver.recv() => match op {
                Some(op) => {
                    debug!(operation = %op, "Executing operation");
                    if op.execute(&ctx).await == Flow::Stop {
                        info!("Pod group purged, stopping worker");
                        break;
                    }
                }
                None => break,
            },
            _ = token.cancelled(), if receiver.is_empty() => {
                info!("Stop requested and queue drained");
                break;
            }
        }
    }
}
