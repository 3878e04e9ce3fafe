//! Placement view: the runtime's containers per pod group.

use std::collections::HashMap;

use api_types::RuntimeEaglePod;
use tokio::sync::RwLock;
use tracing::debug;

use super::cluster::Cluster;
use super::cluster::ClusterResult;

/// Caches, per pod group, the containers the runtime reported last.
///
/// Refreshed by the placement snapshot operation; every other reader works on
/// the cached copy.
#[derive(Default)]
pub struct EagleView {
    groups: RwLock<HashMap<(String, String), Vec<RuntimeEaglePod>>>,
}

impl EagleView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-reads the group's containers from the runtime and caches them.
    #[tracing::instrument(skip(self, cluster))]
    pub async fn refresh_group(
        &self,
        cluster: &dyn Cluster,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Vec<RuntimeEaglePod>> {
        let containers = cluster.list_containers(namespace, name).await?;
        debug!(
            namespace = %namespace,
            name = %name,
            containers = containers.len(),
            "Placement view refreshed"
        );
        self.groups
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), containers.clone());
        Ok(containers)
    }

    pub async fn group_containers(&self, namespace: &str, name: &str) -> Vec<RuntimeEaglePod> {
        self.groups
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn forget_group(&self, namespace: &str, name: &str) {
        self.groups
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use api_types::PodSpec;

    use super::*;
    use crate::infrastructure::cluster::InstanceRequest;
    use crate::infrastructure::local_cluster::LocalCluster;

    #[tokio::test]
    async fn refresh_caches_group_containers() {
        let cluster = LocalCluster::new(vec!["node-a".to_string()]);
        for instance_no in 1..=2 {
            cluster
                .deploy(&InstanceRequest {
                    namespace: "shop".to_string(),
                    name: "shop.web".to_string(),
                    instance_no,
                    version: 0,
                    pod: PodSpec::default(),
                    preferred_node: None,
                })
                .await
                .expect("deploy");
        }

        let view = EagleView::new();
        assert!(view.group_containers("shop", "shop.web").await.is_empty());

        let refreshed = view
            .refresh_group(&cluster, "shop", "shop.web")
            .await
            .expect("refresh");
        assert_eq!(refreshed.len(), 2);
        assert_eq!(view.group_containers("shop", "shop.web").await, refreshed);

        view.forget_group("shop", "shop.web").await;
        assert!(view.group_containers("shop", "shop.web").await.is_empty());
    }
}
