//! One instance slot of a pod group.

use api_types::ContainerObservation;
use api_types::ContainerPlacement;
use api_types::Dependency;
use api_types::DependencyEvent;
use api_types::DependencyEventType;
use api_types::DependencyPolicy;
use api_types::HealthState;
use api_types::Pod;
use api_types::PodSpec;
use api_types::RestartPolicy;
use api_types::RunState;
use api_types::RuntimeEaglePod;
use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::infrastructure::cluster::Cluster;
use crate::infrastructure::cluster::ClusterError;
use crate::infrastructure::cluster::InstanceRequest;
use crate::infrastructure::publisher::Publisher;

/// What an instance operation needs from its group.
pub struct InstanceContext<'a> {
    pub cluster: &'a dyn Cluster,
    pub publisher: &'a Publisher,
    pub namespace: &'a str,
    pub name: &'a str,
    pub dependencies: &'a [Dependency],
    pub restart_policy: RestartPolicy,
}

impl InstanceContext<'_> {
    /// Publishes one event per declared dependency for `node_name`.
    ///
    /// Node level dependencies resolve their namespace to the node itself.
    fn emit(&self, event_type: DependencyEventType, node_name: &str) {
        if node_name.is_empty() {
            return;
        }
        for dependency in self.dependencies {
            let namespace = match dependency.policy {
                DependencyPolicy::NodeLevel => node_name,
                DependencyPolicy::NamespaceLevel => self.namespace,
            };
            self.publisher.emit(DependencyEvent {
                event_type,
                name: dependency.pod_name.clone(),
                node_name: node_name.to_string(),
                namespace: namespace.to_string(),
            });
        }
    }

    fn emit_moved(&self, from: &str, to: &str) {
        if from != to {
            self.emit(DependencyEventType::Remove, from);
            self.emit(DependencyEventType::Add, to);
        }
    }
}

fn failure_message(report: &Report<ClusterError>) -> String {
    report.current_context().to_string()
}

/// Desired template and observed runtime record of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodController {
    pub spec: PodSpec,
    pub pod: Pod,
}

impl PodController {
    pub fn new(spec: PodSpec, instance_no: usize) -> Self {
        Self {
            spec,
            pod: Pod::new(instance_no),
        }
    }

    pub fn instance_no(&self) -> usize {
        self.pod.instance_no
    }

    pub fn health(&self) -> HealthState {
        self.pod.health
    }

    /// Copies the current placement into the template's previous state.
    pub fn record_prev_state(&mut self) {
        self.spec.prev_state = self.pod.prev_state();
    }

    fn request(&self, ctx: &InstanceContext<'_>, version: u64) -> InstanceRequest {
        let preferred_node = Some(&self.spec.prev_state.node_name)
            .filter(|node| !node.is_empty())
            .or(Some(&self.pod.node_name).filter(|node| !node.is_empty()))
            .cloned();
        InstanceRequest {
            namespace: ctx.namespace.to_string(),
            name: ctx.name.to_string(),
            instance_no: self.instance_no(),
            version,
            pod: self.spec.clone(),
            preferred_node,
        }
    }

    fn placed(&mut self, ctx: &InstanceContext<'_>, placement: &ContainerPlacement, version: u64) {
        info!(
            namespace = %ctx.namespace,
            name = %ctx.name,
            instance_no = self.instance_no(),
            container_id = %placement.container_id,
            node_name = %placement.node_name,
            "Instance placed"
        );
        self.pod.apply_placement(placement, version);
    }

    fn failed(&mut self, ctx: &InstanceContext<'_>, action: &str, report: &Report<ClusterError>) {
        warn!(
            namespace = %ctx.namespace,
            name = %ctx.name,
            instance_no = self.instance_no(),
            action = action,
            error = ?report,
            "Instance operation failed"
        );
        self.pod.mark_failed(format!("{action} failed: {}", failure_message(report)));
    }

    /// Starts the instance, adopting a running container of the same version
    /// the placement view already knows.
    pub async fn deploy(
        &mut self,
        ctx: &InstanceContext<'_>,
        version: u64,
        known: &[RuntimeEaglePod],
    ) {
        let adoptable = known.iter().find(|c| {
            c.running && c.instance_no == self.instance_no() && c.version == version
        });
        if let Some(container) = adoptable {
            debug!(
                namespace = %ctx.namespace,
                name = %ctx.name,
                instance_no = self.instance_no(),
                container_id = %container.container_id,
                "Adopting running container"
            );
            self.placed(ctx, &container.placement(), version);
            ctx.emit(DependencyEventType::Add, &container.node_name);
            return;
        }

        let request = self.request(ctx, version);
        match ctx.cluster.deploy(&request).await {
            Ok(placement) => {
                self.placed(ctx, &placement, version);
                ctx.emit(DependencyEventType::Add, &placement.node_name);
            }
            Err(report) => self.failed(ctx, "deploy", &report),
        }
    }

    /// Replaces the template and recreates the container from it.
    pub async fn upgrade(&mut self, ctx: &InstanceContext<'_>, version: u64, new_spec: &PodSpec) {
        let prev_state = std::mem::take(&mut self.spec.prev_state);
        self.spec = PodSpec {
            prev_state,
            ..new_spec.clone()
        };

        if self.pod.container_id.is_empty() {
            self.deploy(ctx, version, &[]).await;
            return;
        }

        let old_node = self.pod.node_name.clone();
        let request = self.request(ctx, version);
        match ctx.cluster.upgrade(&self.pod.container_id, &request).await {
            Ok(placement) => {
                self.placed(ctx, &placement, version);
                ctx.emit_moved(&old_node, &placement.node_name);
            }
            Err(report) => self.failed(ctx, "upgrade", &report),
        }
    }

    /// Moves the instance off `from`.
    ///
    /// Instances on another node are left alone; stateful instances only move
    /// when forced.
    pub async fn drift(
        &mut self,
        ctx: &InstanceContext<'_>,
        from: &str,
        to: Option<&str>,
        force: bool,
    ) {
        if self.pod.node_name != from || self.pod.container_id.is_empty() {
            debug!(
                namespace = %ctx.namespace,
                name = %ctx.name,
                instance_no = self.instance_no(),
                node_name = %self.pod.node_name,
                from = %from,
                "Instance not on drift source, skipping"
            );
            return;
        }
        if self.spec.stateful && !force {
            info!(
                namespace = %ctx.namespace,
                name = %ctx.name,
                instance_no = self.instance_no(),
                "Stateful instance only drifts when forced"
            );
            return;
        }

        let version = self.pod.version;
        let mut request = self.request(ctx, version);
        request.preferred_node = to.map(str::to_string);
        match ctx.cluster.drift(&self.pod.container_id, &request, to).await {
            Ok(placement) => {
                self.placed(ctx, &placement, version);
                self.record_prev_state();
                ctx.emit_moved(from, &placement.node_name);
            }
            Err(report) => self.failed(ctx, "drift", &report),
        }
    }

    /// Removes the instance's container and any container the placement view
    /// still lists for this instance.
    pub async fn remove(&mut self, ctx: &InstanceContext<'_>, known: &[RuntimeEaglePod]) {
        let mut container_ids: Vec<&str> = Vec::new();
        if !self.pod.container_id.is_empty() {
            container_ids.push(&self.pod.container_id);
        }
        for container in known.iter().filter(|c| c.instance_no == self.instance_no()) {
            if !container_ids.contains(&container.container_id.as_str()) {
                container_ids.push(&container.container_id);
            }
        }

        let mut last_error = None;
        for container_id in container_ids {
            if let Err(report) = ctx.cluster.remove(container_id).await {
                if matches!(
                    report.current_context(),
                    ClusterError::ContainerNotFound { .. }
                ) {
                    continue;
                }
                warn!(
                    namespace = %ctx.namespace,
                    name = %ctx.name,
                    instance_no = self.instance_no(),
                    container_id = %container_id,
                    error = ?report,
                    "Failed to remove container"
                );
                last_error = Some(format!("remove failed: {}", failure_message(&report)));
            }
        }

        let node_name = self.pod.node_name.clone();
        self.pod.mark_removed();
        if let Some(error) = last_error {
            self.pod.last_error = error;
        }
        ctx.emit(DependencyEventType::Remove, &node_name);
    }

    /// Reconciles the observed container with the desired template.
    pub async fn refresh(&mut self, ctx: &InstanceContext<'_>, version: u64) {
        if self.pod.container_id.is_empty() {
            debug!(
                namespace = %ctx.namespace,
                name = %ctx.name,
                instance_no = self.instance_no(),
                "Instance has no container, deploying"
            );
            self.deploy(ctx, version, &[]).await;
            return;
        }

        let observation = match ctx.cluster.inspect(&self.pod.container_id).await {
            Ok(observation) => observation,
            Err(report) => {
                self.failed(ctx, "inspect", &report);
                return;
            }
        };

        match observation {
            ContainerObservation::Running(placement) => {
                let old_node = self.pod.node_name.clone();
                self.pod.node_name = placement.node_name.clone();
                self.pod.ip = placement.ip;
                self.pod.health = placement.health;
                self.pod.state = RunState::Success;
                self.pod.last_error.clear();

                if self.pod.version < version {
                    info!(
                        namespace = %ctx.namespace,
                        name = %ctx.name,
                        instance_no = self.instance_no(),
                        running = self.pod.version,
                        desired = version,
                        "Instance runs an outdated version, upgrading"
                    );
                    let spec = self.spec.clone();
                    self.upgrade(ctx, version, &spec).await;
                } else if old_node != placement.node_name {
                    ctx.emit_moved(&old_node, &placement.node_name);
                } else {
                    ctx.emit(DependencyEventType::Verify, &placement.node_name);
                }
            }
            ContainerObservation::Exited { code, placement } => {
                let restart = match ctx.restart_policy {
                    RestartPolicy::Always => true,
                    RestartPolicy::OnFail => code != 0,
                    RestartPolicy::Never => false,
                };
                if restart {
                    info!(
                        namespace = %ctx.namespace,
                        name = %ctx.name,
                        instance_no = self.instance_no(),
                        exit_code = code,
                        policy = %ctx.restart_policy,
                        "Restarting exited instance"
                    );
                    self.restart(ctx, version, Some(&placement.container_id)).await;
                } else {
                    self.pod.health = placement.health;
                    self.pod.mark_failed(format!("container exited with code {code}"));
                }
            }
            ContainerObservation::Missing => {
                warn!(
                    namespace = %ctx.namespace,
                    name = %ctx.name,
                    instance_no = self.instance_no(),
                    container_id = %self.pod.container_id,
                    "Container missing, redeploying"
                );
                self.restart(ctx, version, None).await;
            }
        }
    }

    async fn restart(&mut self, ctx: &InstanceContext<'_>, version: u64, stale: Option<&str>) {
        if let Some(container_id) = stale {
            if let Err(report) = ctx.cluster.remove(container_id).await {
                debug!(container_id = %container_id, error = ?report, "Stale container not removed");
            }
        }
        self.record_prev_state();
        self.pod.container_id.clear();
        self.pod.restart_count += 1;
        self.deploy(ctx, version, &[]).await;
    }
}

#[cfg(test)]
mod tests {
    use api_types::ContainerSpec;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::podgroup::mock::ClusterCall;
    use crate::domain::podgroup::mock::MockCluster;

    fn web_spec() -> PodSpec {
        PodSpec {
            namespace: "shop".to_string(),
            name: "shop.web".to_string(),
            containers: vec![ContainerSpec {
                name: "web".to_string(),
                image: "registry/shop:1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn dependencies() -> Vec<Dependency> {
        vec![
            Dependency {
                pod_name: "shop.redis".to_string(),
                policy: DependencyPolicy::NamespaceLevel,
            },
            Dependency {
                pod_name: "infra.agent".to_string(),
                policy: DependencyPolicy::NodeLevel,
            },
        ]
    }

    fn context<'a>(
        cluster: &'a MockCluster,
        publisher: &'a Publisher,
        dependencies: &'a [Dependency],
        restart_policy: RestartPolicy,
    ) -> InstanceContext<'a> {
        InstanceContext {
            cluster,
            publisher,
            namespace: "shop",
            name: "shop.web",
            dependencies,
            restart_policy,
        }
    }

    #[tokio::test]
    async fn deploy_emits_events_per_dependency() {
        let cluster = MockCluster::new();
        let publisher = Publisher::new(16);
        let mut events = publisher.subscribe();
        let deps = dependencies();
        let ctx = context(&cluster, &publisher, &deps, RestartPolicy::Always);

        let mut ctrl = PodController::new(web_spec(), 1);
        ctrl.deploy(&ctx, 3, &[]).await;

        assert_eq!(ctrl.pod.state, RunState::Success);
        assert_eq!(ctrl.pod.version, 3);
        assert!(!ctrl.pod.ip.is_empty());

        let first = events.recv().await.expect("event");
        let second = events.recv().await.expect("event");
        assert_eq!(first.event_type, DependencyEventType::Add);
        assert_eq!(first.namespace, "shop");
        assert_eq!(second.name, "infra.agent");
        assert_eq!(second.namespace, ctrl.pod.node_name);
    }

    #[tokio::test]
    async fn deploy_adopts_known_container() {
        let cluster = MockCluster::new();
        let publisher = Publisher::new(16);
        let ctx = context(&cluster, &publisher, &[], RestartPolicy::Always);
        let known = vec![RuntimeEaglePod {
            namespace: "shop".to_string(),
            name: "shop.web".to_string(),
            instance_no: 2,
            version: 1,
            container_id: "known-2".to_string(),
            node_name: "node-b".to_string(),
            ip: "10.0.0.9".to_string(),
            running: true,
        }];

        let mut ctrl = PodController::new(web_spec(), 2);
        ctrl.deploy(&ctx, 1, &known).await;

        assert_eq!(ctrl.pod.container_id, "known-2");
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn deploy_failure_marks_instance_failed() {
        let cluster = MockCluster::new();
        cluster.fail_deploy(1);
        let publisher = Publisher::new(16);
        let ctx = context(&cluster, &publisher, &[], RestartPolicy::Always);

        let mut ctrl = PodController::new(web_spec(), 1);
        ctrl.deploy(&ctx, 0, &[]).await;

        assert_eq!(ctrl.pod.state, RunState::Fail);
        assert!(ctrl.pod.last_error.starts_with("deploy failed"));
    }

    #[tokio::test]
    async fn drift_skips_other_nodes_and_stateful() {
        let cluster = MockCluster::new();
        let publisher = Publisher::new(16);
        let ctx = context(&cluster, &publisher, &[], RestartPolicy::Always);

        let mut ctrl = PodController::new(web_spec(), 1);
        ctrl.deploy(&ctx, 0, &[]).await;
        let node = ctrl.pod.node_name.clone();

        ctrl.drift(&ctx, "elsewhere", None, false).await;
        assert_eq!(ctrl.pod.node_name, node);

        ctrl.spec.stateful = true;
        ctrl.drift(&ctx, &node, Some("node-z"), false).await;
        assert_eq!(ctrl.pod.node_name, node);

        ctrl.drift(&ctx, &node, Some("node-z"), true).await;
        assert_eq!(ctrl.pod.node_name, "node-z");
        assert_eq!(ctrl.spec.prev_state.node_name, "node-z");
    }

    #[tokio::test]
    async fn refresh_applies_restart_policy() {
        let cluster = MockCluster::new();
        let publisher = Publisher::new(16);

        let ctx = context(&cluster, &publisher, &[], RestartPolicy::OnFail);
        let mut ctrl = PodController::new(web_spec(), 1);
        ctrl.deploy(&ctx, 0, &[]).await;

        cluster.set_observation(
            &ctrl.pod.container_id,
            ContainerObservation::Exited {
                code: 0,
                placement: ContainerPlacement::default(),
            },
        );
        ctrl.refresh(&ctx, 0).await;
        assert_eq!(ctrl.pod.state, RunState::Fail);
        assert_eq!(ctrl.pod.restart_count, 0);

        cluster.set_observation(
            &ctrl.pod.container_id,
            ContainerObservation::Exited {
                code: 1,
                placement: ContainerPlacement::default(),
            },
        );
        ctrl.refresh(&ctx, 0).await;
        assert_eq!(ctrl.pod.state, RunState::Success);
        assert_eq!(ctrl.pod.restart_count, 1);
    }

    #[tokio::test]
    async fn refresh_upgrades_outdated_instance() {
        let cluster = MockCluster::new();
        let publisher = Publisher::new(16);
        let ctx = context(&cluster, &publisher, &[], RestartPolicy::Always);

        let mut ctrl = PodController::new(web_spec(), 1);
        ctrl.deploy(&ctx, 1, &[]).await;
        ctrl.refresh(&ctx, 2).await;

        assert_eq!(ctrl.pod.version, 2);
        assert!(cluster
            .calls()
            .iter()
            .any(|call| matches!(call, ClusterCall::Upgrade { instance_no: 1, .. })));
    }

    #[tokio::test]
    async fn remove_cleans_known_containers() {
        let cluster = MockCluster::new();
        let publisher = Publisher::new(16);
        let ctx = context(&cluster, &publisher, &[], RestartPolicy::Always);

        let mut ctrl = PodController::new(web_spec(), 1);
        ctrl.deploy(&ctx, 0, &[]).await;
        let known = vec![RuntimeEaglePod {
            namespace: "shop".to_string(),
            name: "shop.web".to_string(),
            instance_no: 1,
            version: 0,
            container_id: "orphan".to_string(),
            node_name: "node-a".to_string(),
            ip: String::new(),
            running: true,
        }];

        ctrl.remove(&ctx, &known).await;

        assert_eq!(ctrl.pod.state, RunState::Removed);
        let removed: Vec<String> = cluster
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ClusterCall::Remove { container_id } => Some(container_id),
                _ => None,
            })
            .collect();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&"orphan".to_string()));
    }
}
