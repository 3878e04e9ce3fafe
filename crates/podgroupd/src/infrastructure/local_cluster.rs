//! In-process container runtime.
//!
//! Places instances on a fixed node list and keeps the container table in
//! memory. The daemon runs on it when no external runtime is wired in, and the
//! lifecycle tests use its hooks to simulate exits, lost containers and lost
//! addresses.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use api_types::ContainerObservation;
use api_types::ContainerPlacement;
use api_types::HealthState;
use api_types::RuntimeEaglePod;
use error_stack::Report;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use super::cluster::Cluster;
use super::cluster::ClusterError;
use super::cluster::ClusterResult;
use super::cluster::InstanceRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContainer {
    pub container_id: String,
    pub namespace: String,
    pub name: String,
    pub instance_no: usize,
    pub version: u64,
    pub node_name: String,
    pub ip: String,
    pub health: HealthState,
    /// `None` while running, the exit code once stopped
    pub exit_code: Option<i32>,
}

impl LocalContainer {
    fn placement(&self) -> ContainerPlacement {
        ContainerPlacement {
            container_id: self.container_id.clone(),
            node_name: self.node_name.clone(),
            ip: self.ip.clone(),
            health: self.health,
        }
    }
}

pub struct LocalCluster {
    nodes: Vec<String>,
    containers: RwLock<BTreeMap<String, LocalContainer>>,
    next_id: AtomicU64,
    initial_health: HealthState,
}

impl LocalCluster {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            containers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            initial_health: HealthState::Healthy,
        }
    }

    /// Health reported for freshly started containers
    pub fn with_initial_health(mut self, health: HealthState) -> Self {
        self.initial_health = health;
        self
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub async fn containers(&self) -> Vec<LocalContainer> {
        self.containers.read().await.values().cloned().collect()
    }

    /// Stops a container as if its process exited with `code`.
    pub async fn exit_container(&self, container_id: &str, code: i32) -> bool {
        let mut containers = self.containers.write().await;
        match containers.get_mut(container_id) {
            Some(container) => {
                container.exit_code = Some(code);
                true
            }
            None => false,
        }
    }

    /// Drops a container without going through `remove`.
    pub async fn lose_container(&self, container_id: &str) -> bool {
        self.containers.write().await.remove(container_id).is_some()
    }

    pub async fn clear_ip(&self, container_id: &str) -> bool {
        let mut containers = self.containers.write().await;
        match containers.get_mut(container_id) {
            Some(container) => {
                container.ip.clear();
                true
            }
            None => false,
        }
    }

    pub async fn set_health(&self, container_id: &str, health: HealthState) -> bool {
        let mut containers = self.containers.write().await;
        match containers.get_mut(container_id) {
            Some(container) => {
                container.health = health;
                true
            }
            None => false,
        }
    }

    /// Picks the preferred node when it is known, otherwise the least loaded
    /// node not listed in `exclude`.
    fn pick_node(
        &self,
        containers: &BTreeMap<String, LocalContainer>,
        preferred: Option<&str>,
        exclude: Option<&str>,
    ) -> Option<String> {
        if let Some(preferred) = preferred {
            if Some(preferred) != exclude && self.nodes.iter().any(|n| n == preferred) {
                return Some(preferred.to_string());
            }
        }

        self.nodes
            .iter()
            .filter(|node| Some(node.as_str()) != exclude)
            .min_by_key(|node| {
                containers
                    .values()
                    .filter(|c| &c.node_name == *node && c.exit_code.is_none())
                    .count()
            })
            .cloned()
    }

    fn start(
        &self,
        containers: &mut BTreeMap<String, LocalContainer>,
        request: &InstanceRequest,
        node_name: String,
    ) -> ContainerPlacement {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let container = LocalContainer {
            container_id: format!("local-{seq:08x}"),
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            instance_no: request.instance_no,
            version: request.version,
            node_name,
            ip: format!("172.20.{}.{}", seq / 250, seq % 250 + 2),
            health: self.initial_health,
            exit_code: None,
        };
        let placement = container.placement();
        info!(
            namespace = %request.namespace,
            name = %request.name,
            instance_no = request.instance_no,
            container_id = %container.container_id,
            node_name = %container.node_name,
            "Container started"
        );
        containers.insert(container.container_id.clone(), container);
        placement
    }

    fn no_node(request: &InstanceRequest) -> Report<ClusterError> {
        Report::new(ClusterError::NoNodeAvailable {
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            instance_no: request.instance_no,
        })
    }

    fn not_found(container_id: &str) -> Report<ClusterError> {
        Report::new(ClusterError::ContainerNotFound {
            container_id: container_id.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Cluster for LocalCluster {
    async fn deploy(&self, request: &InstanceRequest) -> ClusterResult<ContainerPlacement> {
        let mut containers = self.containers.write().await;
        let node = self
            .pick_node(&containers, request.preferred_node.as_deref(), None)
            .ok_or_else(|| Self::no_node(request))?;
        Ok(self.start(&mut containers, request, node))
    }

    async fn upgrade(
        &self,
        container_id: &str,
        request: &InstanceRequest,
    ) -> ClusterResult<ContainerPlacement> {
        let mut containers = self.containers.write().await;
        let old = containers
            .remove(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        let node = self
            .pick_node(&containers, Some(&old.node_name), None)
            .ok_or_else(|| Self::no_node(request))?;
        Ok(self.start(&mut containers, request, node))
    }

    async fn drift(
        &self,
        container_id: &str,
        request: &InstanceRequest,
        to: Option<&str>,
    ) -> ClusterResult<ContainerPlacement> {
        let mut containers = self.containers.write().await;
        let from = containers
            .get(container_id)
            .map(|c| c.node_name.clone())
            .ok_or_else(|| Self::not_found(container_id))?;

        let node = match to {
            Some(to) if self.nodes.iter().any(|n| n == to) => to.to_string(),
            Some(to) => {
                return Err(Report::new(ClusterError::UnknownNode {
                    node_name: to.to_string(),
                }))
            }
            None => self
                .pick_node(&containers, None, Some(&from))
                .ok_or_else(|| Self::no_node(request))?,
        };

        containers.remove(container_id);
        Ok(self.start(&mut containers, request, node))
    }

    async fn remove(&self, container_id: &str) -> ClusterResult<()> {
        let removed = self.containers.write().await.remove(container_id);
        match removed {
            Some(container) => {
                debug!(
                    container_id = %container_id,
                    node_name = %container.node_name,
                    "Container removed"
                );
                Ok(())
            }
            None => Err(Self::not_found(container_id)),
        }
    }

    async fn inspect(&self, container_id: &str) -> ClusterResult<ContainerObservation> {
        let containers = self.containers.read().await;
        let observation = match containers.get(container_id) {
            None => ContainerObservation::Missing,
            Some(container) => match container.exit_code {
                None => ContainerObservation::Running(container.placement()),
                Some(code) => ContainerObservation::Exited {
                    code,
                    placement: container.placement(),
                },
            },
        };
        Ok(observation)
    }

    async fn list_containers(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Vec<RuntimeEaglePod>> {
        let containers = self.containers.read().await;
        Ok(containers
            .values()
            .filter(|c| c.namespace == namespace && c.name == name)
            .map(|c| RuntimeEaglePod {
                namespace: c.namespace.clone(),
                name: c.name.clone(),
                instance_no: c.instance_no,
                version: c.version,
                container_id: c.container_id.clone(),
                node_name: c.node_name.clone(),
                ip: c.ip.clone(),
                running: c.exit_code.is_none(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use api_types::PodSpec;

    use super::*;

    fn request(instance_no: usize, preferred: Option<&str>) -> InstanceRequest {
        InstanceRequest {
            namespace: "shop".to_string(),
            name: "shop.web".to_string(),
            instance_no,
            version: 1,
            pod: PodSpec::default(),
            preferred_node: preferred.map(str::to_string),
        }
    }

    fn cluster() -> LocalCluster {
        LocalCluster::new(vec!["node-a".to_string(), "node-b".to_string()])
    }

    #[tokio::test]
    async fn deploy_spreads_across_nodes() {
        let cluster = cluster();
        let first = cluster.deploy(&request(1, None)).await.expect("deploy");
        let second = cluster.deploy(&request(2, None)).await.expect("deploy");

        assert_ne!(first.node_name, second.node_name);
        assert_ne!(first.ip, second.ip);
        assert_eq!(first.health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn deploy_prefers_previous_node() {
        let cluster = cluster();
        cluster.deploy(&request(1, None)).await.expect("deploy");
        let placement = cluster
            .deploy(&request(2, Some("node-a")))
            .await
            .expect("deploy");
        assert_eq!(placement.node_name, "node-a");

        let placement = cluster
            .deploy(&request(3, Some("gone")))
            .await
            .expect("deploy");
        assert_eq!(placement.node_name, "node-b");
    }

    #[tokio::test]
    async fn deploy_without_nodes_fails() {
        let cluster = LocalCluster::new(Vec::new());
        let err = cluster.deploy(&request(1, None)).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            ClusterError::NoNodeAvailable { instance_no: 1, .. }
        ));
    }

    #[tokio::test]
    async fn drift_moves_to_another_node() {
        let cluster = cluster();
        let placement = cluster
            .deploy(&request(1, Some("node-a")))
            .await
            .expect("deploy");

        let moved = cluster
            .drift(&placement.container_id, &request(1, None), None)
            .await
            .expect("drift");
        assert_eq!(moved.node_name, "node-b");

        let err = cluster
            .drift(&moved.container_id, &request(1, None), Some("node-z"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ClusterError::UnknownNode { .. }
        ));
    }

    #[tokio::test]
    async fn inspect_reports_exit_and_missing() {
        let cluster = cluster();
        let placement = cluster.deploy(&request(1, None)).await.expect("deploy");

        assert!(cluster.exit_container(&placement.container_id, 137).await);
        let observed = cluster
            .inspect(&placement.container_id)
            .await
            .expect("inspect");
        assert!(matches!(
            observed,
            ContainerObservation::Exited { code: 137, .. }
        ));

        cluster
            .remove(&placement.container_id)
            .await
            .expect("remove");
        let observed = cluster
            .inspect(&placement.container_id)
            .await
            .expect("inspect");
        assert_eq!(observed, ContainerObservation::Missing);
        assert!(cluster.remove(&placement.container_id).await.is_err());
    }

    #[tokio::test]
    async fn list_containers_filters_by_group() {
        let cluster = cluster();
        cluster.deploy(&request(1, None)).await.expect("deploy");
        let mut other = request(1, None);
        other.name = "shop.worker".to_string();
        cluster.deploy(&other).await.expect("deploy");

        let listed = cluster
            .list_containers("shop", "shop.web")
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].running);
        assert_eq!(listed[0].instance_no, 1);
    }
}
