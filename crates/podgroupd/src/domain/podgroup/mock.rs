//! Scripted runtime for controller tests
//!
//! Records every call, hands out predictable placements and lets a test inject
//! failures or override what `inspect` reports.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use api_types::ContainerObservation;
use api_types::ContainerPlacement;
use api_types::HealthState;
use api_types::RuntimeEaglePod;
use error_stack::Report;

use crate::infrastructure::cluster::Cluster;
use crate::infrastructure::cluster::ClusterError;
use crate::infrastructure::cluster::ClusterResult;
use crate::infrastructure::cluster::InstanceRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Deploy { instance_no: usize, version: u64 },
    Upgrade { instance_no: usize, version: u64 },
    Drift { instance_no: usize, to: Option<String> },
    Remove { container_id: String },
    Inspect { container_id: String },
    List,
}

#[derive(Debug, Clone)]
struct MockContainer {
    request: InstanceRequest,
    placement: ContainerPlacement,
}

#[derive(Default)]
struct MockState {
    calls: Vec<ClusterCall>,
    containers: HashMap<String, MockContainer>,
    observations: HashMap<String, ContainerObservation>,
    failing_deploys: HashSet<usize>,
    next_id: u64,
    health: Option<HealthState>,
    without_ip: bool,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Every deploy of `instance_no` fails from now on
    pub fn fail_deploy(&self, instance_no: usize) {
        self.state
            .lock()
            .unwrap()
            .failing_deploys
            .insert(instance_no);
    }

    pub fn set_health(&self, health: HealthState) {
        self.state.lock().unwrap().health = Some(health);
    }

    /// New placements come without an address
    pub fn set_without_ip(&self, without_ip: bool) {
        self.state.lock().unwrap().without_ip = without_ip;
    }

    pub fn set_observation(&self, container_id: &str, observation: ContainerObservation) {
        self.state
            .lock()
            .unwrap()
            .observations
            .insert(container_id.to_string(), observation);
    }

    /// Starts a container the controller never asked for
    pub fn start_unmanaged(&self, request: InstanceRequest) -> String {
        let mut state = self.state.lock().unwrap();
        Self::place(&mut state, &request, "node-a".to_string()).container_id
    }

    fn place(state: &mut MockState, request: &InstanceRequest, node_name: String) -> ContainerPlacement {
        state.next_id += 1;
        let placement = ContainerPlacement {
            container_id: format!("mock-{}", state.next_id),
            node_name,
            ip: if state.without_ip {
                String::new()
            } else {
                format!("10.0.{}.{}", request.instance_no, state.next_id)
            },
            health: state.health.unwrap_or(HealthState::Healthy),
        };
        state.containers.insert(
            placement.container_id.clone(),
            MockContainer {
                request: request.clone(),
                placement: placement.clone(),
            },
        );
        placement
    }
}

#[async_trait::async_trait]
impl Cluster for MockCluster {
    async fn deploy(&self, request: &InstanceRequest) -> ClusterResult<ContainerPlacement> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Deploy {
            instance_no: request.instance_no,
            version: request.version,
        });
        if state.failing_deploys.contains(&request.instance_no) {
            return Err(Report::new(ClusterError::Runtime {
                message: "image pull failed".to_string(),
            }));
        }
        let node = request
            .preferred_node
            .clone()
            .unwrap_or_else(|| "node-a".to_string());
        Ok(Self::place(&mut state, request, node))
    }

    async fn upgrade(
        &self,
        container_id: &str,
        request: &InstanceRequest,
    ) -> ClusterResult<ContainerPlacement> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Upgrade {
            instance_no: request.instance_no,
            version: request.version,
        });
        let old = state.containers.remove(container_id).ok_or_else(|| {
            Report::new(ClusterError::ContainerNotFound {
                container_id: container_id.to_string(),
            })
        })?;
        Ok(Self::place(&mut state, request, old.placement.node_name))
    }

    async fn drift(
        &self,
        container_id: &str,
        request: &InstanceRequest,
        to: Option<&str>,
    ) -> ClusterResult<ContainerPlacement> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Drift {
            instance_no: request.instance_no,
            to: to.map(str::to_string),
        });
        let old = state.containers.remove(container_id).ok_or_else(|| {
            Report::new(ClusterError::ContainerNotFound {
                container_id: container_id.to_string(),
            })
        })?;
        let node = match to {
            Some(to) => to.to_string(),
            None if old.placement.node_name == "node-a" => "node-b".to_string(),
            None => "node-a".to_string(),
        };
        Ok(Self::place(&mut state, request, node))
    }

    async fn remove(&self, container_id: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Remove {
            container_id: container_id.to_string(),
        });
        state.containers.remove(container_id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> ClusterResult<ContainerObservation> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Inspect {
            container_id: container_id.to_string(),
        });
        if let Some(observation) = state.observations.get(container_id) {
            return Ok(observation.clone());
        }
        Ok(match state.containers.get(container_id) {
            Some(container) => ContainerObservation::Running(container.placement.clone()),
            None => ContainerObservation::Missing,
        })
    }

    async fn list_containers(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Vec<RuntimeEaglePod>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::List);
        let mut containers: Vec<RuntimeEaglePod> = state
            .containers
            .values()
            .filter(|c| c.request.namespace == namespace && c.request.name == name)
            .map(|c| RuntimeEaglePod {
                namespace: c.request.namespace.clone(),
                name: c.request.name.clone(),
                instance_no: c.request.instance_no,
                version: c.request.version,
                container_id: c.placement.container_id.clone(),
                node_name: c.placement.node_name.clone(),
                ip: c.placement.ip.clone(),
                running: true,
            })
            .collect();
        containers.sort_by_key(|c| c.instance_no);
        Ok(containers)
    }
}
