//! Container runtime abstraction used by pod controllers.

use core::error::Error;

use api_types::ContainerObservation;
use api_types::ContainerPlacement;
use api_types::PodSpec;
use api_types::RuntimeEaglePod;
use derive_more::Display;
use error_stack::Report;

pub type ClusterResult<T> = Result<T, Report<ClusterError>>;

#[derive(Debug, Display)]
pub enum ClusterError {
    #[display("No node available for {namespace}/{name} instance {instance_no}")]
    NoNodeAvailable {
        namespace: String,
        name: String,
        instance_no: usize,
    },
    #[display("Unknown node: {node_name}")]
    UnknownNode { node_name: String },
    #[display("Container not found: {container_id}")]
    ContainerNotFound { container_id: String },
    #[display("Runtime error: {message}")]
    Runtime { message: String },
}

impl Error for ClusterError {}

/// Everything the runtime needs to start one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub namespace: String,
    /// Pod group name
    pub name: String,
    pub instance_no: usize,
    pub version: u64,
    pub pod: PodSpec,
    /// Node the instance ran on before, tried first when still available
    pub preferred_node: Option<String>,
}

/// Runtime handle the controller drives instances through.
///
/// Implementations only report success or failure for the addressed instance;
/// the controller records the outcome on the instance itself.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Starts a new container for the instance
    async fn deploy(&self, request: &InstanceRequest) -> ClusterResult<ContainerPlacement>;

    /// Replaces the container with one built from the new template
    async fn upgrade(
        &self,
        container_id: &str,
        request: &InstanceRequest,
    ) -> ClusterResult<ContainerPlacement>;

    /// Moves the container to `to`, or to any other node when `to` is `None`
    async fn drift(
        &self,
        container_id: &str,
        request: &InstanceRequest,
        to: Option<&str>,
    ) -> ClusterResult<ContainerPlacement>;

    async fn remove(&self, container_id: &str) -> ClusterResult<()>;

    async fn inspect(&self, container_id: &str) -> ClusterResult<ContainerObservation>;

    /// Containers the runtime holds for one pod group, running or not
    async fn list_containers(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Vec<RuntimeEaglePod>>;
}
