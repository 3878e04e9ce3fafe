use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use api_types::PodGroupSpec;

use crate::app::services::ApplicationServices;
use crate::app::Application;
use crate::config::ControllerSettings;
use crate::config::DaemonArgs;
use crate::domain::podgroup::ControllerDeps;
use crate::domain::GroupKey;
use crate::domain::PodGroupEngine;
use crate::domain::PortRegistry;
use crate::infrastructure::local_cluster::LocalCluster;
use crate::infrastructure::notify::ChannelNotifier;
use crate::infrastructure::publisher::Publisher;
use crate::infrastructure::store::FileStore;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    ///
    /// Restores every persisted group before the configured groups file is
    /// applied on top.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let store = Arc::new(FileStore::new(self.daemon_args.store_dir.clone()));
        let cluster = Arc::new(LocalCluster::new(self.daemon_args.nodes.clone()));
        let publisher = Publisher::default();
        let (notifier, notifications) = ChannelNotifier::new();

        let deps = ControllerDeps {
            port_registry: PortRegistry::global(),
            publisher: publisher.clone(),
            notifier: Arc::new(notifier),
            settings: ControllerSettings::from(&self.daemon_args),
            store_root: self.daemon_args.store_root.clone(),
        };
        let engine = Arc::new(PodGroupEngine::new(cluster, store, deps));

        let loaded = engine
            .load_from_store()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load pod groups from store: {e:?}"))?;
        tracing::info!(loaded = loaded, "Restored pod groups");

        if let Some(groups_file) = &self.daemon_args.groups_file {
            apply_groups_file(&engine, groups_file).await?;
        }

        let services = ApplicationServices::new(engine, publisher, notifications);
        Ok(Application::new(services, self.daemon_args))
    }
}

/// Ensures every group listed in `path` is deployed with its listed spec.
async fn apply_groups_file(engine: &PodGroupEngine, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read groups file {}", path.display()))?;
    let specs: Vec<PodGroupSpec> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse groups file {}", path.display()))?;

    for spec in specs {
        let key = GroupKey::new(spec.namespace.clone(), spec.name.clone());
        if engine.contains(&key).await {
            tracing::info!(group = %key, "Reconciling configured pod group");
            engine.reschedule_spec(&key, spec.pod.clone()).await?;
            engine
                .reschedule_instance(&key, spec.num_instances, Some(spec.restart_policy))
                .await?;
        } else {
            tracing::info!(group = %key, "Creating configured pod group");
            engine.new_pod_group(spec).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use api_types::RunState;
    use clap::Parser;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    const GROUPS: &str = r#"
- namespace: shop
  name: shop.web
  num_instances: 2
  pod:
    namespace: shop
    name: shop.web
    containers:
      - name: web
        image: registry/shop:1
"#;

    fn args(store_dir: &Path, groups_file: &Path) -> DaemonArgs {
        DaemonArgs::parse_from([
            "daemon",
            "--store-dir",
            store_dir.to_str().expect("utf-8 path"),
            "--nodes",
            "node-a,node-b",
            "--groups-file",
            groups_file.to_str().expect("utf-8 path"),
            "--shutdown-timeout-secs",
            "5",
        ])
    }

    #[test(tokio::test)]
    async fn build_deploys_configured_groups_and_restores_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let groups_file = dir.path().join("groups.yaml");
        std::fs::write(&groups_file, GROUPS).expect("write groups file");
        let store_dir = dir.path().join("store");

        let app = ApplicationBuilder::new(args(&store_dir, &groups_file))
            .build()
            .await
            .expect("first build");
        assert_eq!(app.daemon_args().shutdown_timeout_secs, 5);
        app.shutdown().await.expect("shutdown");
        let groups = app.services().engine.list_pod_groups().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.state, RunState::Success);
        let nodes: Vec<&str> = groups[0]
            .group
            .pods
            .iter()
            .map(|p| p.node_name.as_str())
            .collect();
        assert_eq!(nodes, vec!["node-a", "node-b"]);

        // a second start restores the group instead of creating it again
        let app = ApplicationBuilder::new(args(&store_dir, &groups_file))
            .build()
            .await
            .expect("second build");
        app.shutdown().await.expect("shutdown");
        let restored = app.services().engine.list_pod_groups().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].spec.version, groups[0].spec.version);
    }

    #[test(tokio::test)]
    async fn unreadable_groups_file_fails_the_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let groups_file = dir.path().join("groups.yaml");
        std::fs::write(&groups_file, "- namespace: [").expect("write groups file");

        let result = ApplicationBuilder::new(args(&dir.path().join("store"), &groups_file))
            .build()
            .await;

        assert!(result.is_err());
    }
}
