use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::spec::PodGroupSpec;

/// Run state shared by pod groups and individual pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Pending,
    Success,
    Fail,
    Removed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Health check state of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthState {
    /// No health check has completed yet
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Last known runtime placement of one instance, kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodPrevState {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// Where the runtime placed an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerPlacement {
    pub container_id: String,
    pub node_name: String,
    /// Empty until the network assigned an address
    pub ip: String,
    pub health: HealthState,
}

/// Result of inspecting an instance in the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerObservation {
    Running(ContainerPlacement),
    Exited {
        code: i32,
        placement: ContainerPlacement,
    },
    /// The runtime has no container for the instance
    Missing,
}

/// Runtime record of one instance slot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pod {
    /// 1-based, stable for the lifetime of the slot
    pub instance_no: usize,
    /// Group version the instance was deployed with
    pub version: u64,
    pub state: RunState,
    pub health: HealthState,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Pod {
    pub fn new(instance_no: usize) -> Self {
        Self {
            instance_no,
            ..Default::default()
        }
    }

    /// Network address, empty until assigned
    pub fn pod_ip(&self) -> &str {
        &self.ip
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Records a successful placement reported by the runtime.
    pub fn apply_placement(&mut self, placement: &ContainerPlacement, version: u64) {
        self.container_id = placement.container_id.clone();
        self.node_name = placement.node_name.clone();
        self.ip = placement.ip.clone();
        self.health = placement.health;
        self.version = version;
        self.state = RunState::Success;
        self.last_error.clear();
        self.updated_at = Some(Utc::now());
    }

    /// Records a runtime failure for this instance.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = RunState::Fail;
        self.last_error = error.into();
        self.updated_at = Some(Utc::now());
    }

    /// Clears placement after the instance was removed.
    pub fn mark_removed(&mut self) {
        self.state = RunState::Removed;
        self.health = HealthState::None;
        self.container_id.clear();
        self.ip.clear();
        self.updated_at = Some(Utc::now());
    }

    pub fn prev_state(&self) -> PodPrevState {
        PodPrevState {
            node_name: self.node_name.clone(),
            ips: if self.ip.is_empty() {
                Vec::new()
            } else {
                vec![self.ip.clone()]
            },
        }
    }
}

/// Observed state of a pod group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodGroup {
    pub namespace: String,
    pub name: String,
    pub state: RunState,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PodGroup {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Point-in-time copy of a controller: desired spec, per-instance previous
/// state and observed group. Also the persisted store format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodGroupWithSpec {
    pub spec: PodGroupSpec,
    #[serde(default)]
    pub prev_state: Vec<PodPrevState>,
    pub group: PodGroup,
}

/// A container of a pod group as reported by the runtime placement view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEaglePod {
    pub namespace: String,
    pub name: String,
    pub instance_no: usize,
    pub version: u64,
    pub container_id: String,
    pub node_name: String,
    pub ip: String,
    pub running: bool,
}

impl RuntimeEaglePod {
    pub fn placement(&self) -> ContainerPlacement {
        ContainerPlacement {
            container_id: self.container_id.clone(),
            node_name: self.node_name.clone(),
            ip: self.ip.clone(),
            health: HealthState::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn apply_placement_marks_success() {
        let mut pod = Pod::new(2);
        pod.mark_failed("image not found");

        pod.apply_placement(
            &ContainerPlacement {
                container_id: "c-1".to_string(),
                node_name: "node-a".to_string(),
                ip: "10.1.0.3".to_string(),
                health: HealthState::Starting,
            },
            7,
        );

        assert_eq!(pod.state, RunState::Success);
        assert_eq!(pod.version, 7);
        assert_eq!(pod.pod_ip(), "10.1.0.3");
        assert_eq!(pod.health, HealthState::Starting);
        assert!(pod.last_error.is_empty());
        assert_eq!(pod.instance_no, 2);
    }

    #[test]
    fn prev_state_omits_missing_address() {
        let mut pod = Pod::new(1);
        pod.node_name = "node-a".to_string();
        assert_eq!(
            pod.prev_state(),
            PodPrevState {
                node_name: "node-a".to_string(),
                ips: Vec::new(),
            }
        );

        pod.mark_removed();
        assert_eq!(pod.state, RunState::Removed);
        assert_eq!(pod.node_name(), "node-a");
    }
}
