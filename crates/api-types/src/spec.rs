use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ports::StreamPorts;
use crate::runtime::PodPrevState;

/// What the runtime should do with an instance whose container exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    #[default]
    Always,
    OnFail,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Scope of a declared dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// One dependency instance per namespace
    #[default]
    NamespaceLevel,
    /// One dependency instance per node
    NodeLevel,
}

/// A dependency declared by a pod template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Name of the pod the template depends on
    pub pod_name: String,
    #[serde(default)]
    pub policy: DependencyPolicy,
}

/// One container of a pod template
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Container port exposed to the cluster network
    #[serde(default)]
    pub expose: Option<u16>,
    /// Memory limit in bytes
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_limit: Option<u32>,
}

/// The template every instance of a pod group is started from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodSpec {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub version: u64,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Free-form JSON metadata; the `ports` key declares stream ports
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub stateful: bool,
    /// Seconds an instance needs before the next one may be touched
    #[serde(default)]
    pub setup_time: u64,
    /// Seconds the runtime waits for a graceful stop
    #[serde(default)]
    pub kill_timeout: u64,
    /// Last known placement of the instance this template was handed to
    #[serde(default)]
    pub prev_state: PodPrevState,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PodSpec {
    /// Compares the template content only.
    ///
    /// Bookkeeping fields (`version`, `prev_state`, `updated_at`) are not part
    /// of the template, so two specs differing only there describe the same pod.
    pub fn template_eq(&self, other: &PodSpec) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.containers == other.containers
            && self.dependencies == other.dependencies
            && self.filters == other.filters
            && self.labels == other.labels
            && self.annotation == other.annotation
            && self.stateful == other.stateful
            && self.setup_time == other.setup_time
            && self.kill_timeout == other.kill_timeout
    }

    /// Applies `other` over this template.
    ///
    /// Identity (`namespace`, `name`) and the per-instance `prev_state` are kept,
    /// every template field is taken from `other`. The version is bumped.
    pub fn merge(&self, other: &PodSpec) -> PodSpec {
        PodSpec {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            version: self.version + 1,
            containers: other.containers.clone(),
            dependencies: other.dependencies.clone(),
            filters: other.filters.clone(),
            labels: other.labels.clone(),
            annotation: other.annotation.clone(),
            stateful: other.stateful,
            setup_time: other.setup_time,
            kill_timeout: other.kill_timeout,
            prev_state: self.prev_state.clone(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn setup_time(&self) -> Duration {
        Duration::from_secs(self.setup_time)
    }

    /// Decodes the stream ports declared in the annotation.
    ///
    /// An empty annotation declares no ports.
    pub fn stream_ports(&self) -> Result<StreamPorts, serde_json::Error> {
        if self.annotation.trim().is_empty() {
            return Ok(StreamPorts::default());
        }
        serde_json::from_str(&self.annotation)
    }
}

/// Desired state of a pod group.
///
/// Treated as an immutable value: changes build a new spec and replace the
/// installed one as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodGroupSpec {
    pub namespace: String,
    pub name: String,
    pub pod: PodSpec,
    pub num_instances: usize,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PodGroupSpec {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        pod: PodSpec,
        num_instances: usize,
        restart_policy: RestartPolicy,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            pod,
            num_instances,
            restart_policy,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Dependencies declared by the pod template
    pub fn dependencies(&self) -> &[Dependency] {
        &self.pod.dependencies
    }
}

impl std::fmt::Display for PodGroupSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} v{} x{}",
            self.namespace, self.name, self.version, self.num_instances
        )
    }
}
