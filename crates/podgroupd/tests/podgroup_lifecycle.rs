//! Drives whole pod group lifecycles through the engine, on the in-process
//! runtime and a file store in a temporary directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use api_types::ContainerSpec;
use api_types::Dependency;
use api_types::DependencyEvent;
use api_types::DependencyEventType;
use api_types::DependencyPolicy;
use api_types::NotifyKind;
use api_types::NotifySpec;
use api_types::PodGroupSpec;
use api_types::PodGroupWithSpec;
use api_types::PodSpec;
use api_types::RestartPolicy;
use api_types::RunState;
use podgroupd::config::ControllerSettings;
use podgroupd::domain::podgroup::ControllerDeps;
use podgroupd::domain::GroupKey;
use podgroupd::domain::PodGroupEngine;
use podgroupd::domain::PortRegistry;
use podgroupd::infrastructure::local_cluster::LocalCluster;
use podgroupd::infrastructure::notify::ChannelNotifier;
use podgroupd::infrastructure::publisher::Publisher;
use podgroupd::infrastructure::store::FileStore;
use podgroupd::infrastructure::store::Store;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;

const NODES: [&str; 3] = ["node-a", "node-b", "node-c"];

struct Harness {
    engine: PodGroupEngine,
    cluster: Arc<LocalCluster>,
    store: Arc<FileStore>,
    registry: Arc<PortRegistry>,
    notifications: UnboundedReceiver<NotifySpec>,
    events: broadcast::Receiver<DependencyEvent>,
}

impl Harness {
    fn new(store_dir: &Path) -> Self {
        let cluster = Arc::new(LocalCluster::new(
            NODES.iter().map(|n| n.to_string()).collect(),
        ));
        let store = Arc::new(FileStore::new(store_dir));
        let registry = Arc::new(PortRegistry::new());
        let publisher = Publisher::default();
        let events = publisher.subscribe();
        let (notifier, notifications) = ChannelNotifier::new();
        let deps = ControllerDeps {
            port_registry: registry.clone(),
            publisher,
            notifier: Arc::new(notifier),
            settings: ControllerSettings {
                pacing_poll_interval: Duration::from_millis(10),
                ..ControllerSettings::default()
            },
            store_root: "/podgroupd".to_string(),
        };
        let engine = PodGroupEngine::new(cluster.clone(), store.clone(), deps);
        Self {
            engine,
            cluster,
            store,
            registry,
            notifications,
            events,
        }
    }

    async fn group(&self, key: &GroupKey) -> PodGroupWithSpec {
        self.engine
            .flush_pod_group(key)
            .await
            .expect("worker alive");
        self.engine.inspect_pod_group(key).await.expect("known group")
    }

    async fn running_versions(&self, key: &GroupKey) -> Vec<(usize, u64)> {
        let mut versions: Vec<(usize, u64)> = self
            .cluster
            .containers()
            .await
            .into_iter()
            .filter(|c| c.namespace == key.namespace && c.name == key.name)
            .map(|c| (c.instance_no, c.version))
            .collect();
        versions.sort();
        versions
    }

    fn drain_events(&mut self) -> Vec<DependencyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn web_pod(image: &str) -> PodSpec {
    PodSpec {
        namespace: "shop".to_string(),
        name: "shop.web".to_string(),
        containers: vec![ContainerSpec {
            name: "web".to_string(),
            image: image.to_string(),
            expose: Some(8080),
            ..Default::default()
        }],
        dependencies: vec![Dependency {
            pod_name: "shop.cache".to_string(),
            policy: DependencyPolicy::NodeLevel,
        }],
        annotation: r#"{"ports":[{"srcport":9000,"dstport":8080}]}"#.to_string(),
        ..Default::default()
    }
}

fn web_group(num_instances: usize) -> PodGroupSpec {
    PodGroupSpec::new(
        "shop",
        "shop.web",
        web_pod("registry/shop:1"),
        num_instances,
        RestartPolicy::Always,
    )
}

#[test(tokio::test)]
async fn group_lifecycle_on_local_runtime() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut h = Harness::new(dir.path());
    let key = GroupKey::new("shop", "shop.web");

    // deploy spreads the instances over the nodes
    h.engine.new_pod_group(web_group(3)).await.expect("created");
    let group = h.group(&key).await;
    assert_eq!(group.group.state, RunState::Success);
    let placed: Vec<(usize, &str)> = group
        .group
        .pods
        .iter()
        .map(|p| (p.instance_no, p.node_name.as_str()))
        .collect();
    assert_eq!(placed, vec![(1, "node-a"), (2, "node-b"), (3, "node-c")]);
    let adds: Vec<(DependencyEventType, String)> = h
        .drain_events()
        .into_iter()
        .map(|e| (e.event_type, e.namespace))
        .collect();
    assert_eq!(
        adds,
        vec![
            (DependencyEventType::Add, "node-a".to_string()),
            (DependencyEventType::Add, "node-b".to_string()),
            (DependencyEventType::Add, "node-c".to_string()),
        ]
    );
    assert_eq!(
        h.registry.owner(9000).map(|p| p.proc_name),
        Some("shop.web".to_string())
    );

    // scale down removes the highest instances
    h.engine
        .reschedule_instance(&key, 2, None)
        .await
        .expect("queued");
    let group = h.group(&key).await;
    assert_eq!(group.group.pods.len(), 2);
    assert_eq!(h.running_versions(&key).await, vec![(1, 0), (2, 0)]);

    // a new template rolls every instance
    h.engine
        .reschedule_spec(&key, web_pod("registry/shop:2"))
        .await
        .expect("queued");
    let group = h.group(&key).await;
    assert_eq!(group.spec.version, 1);
    assert_eq!(group.spec.pod.containers[0].image, "registry/shop:2");
    assert_eq!(h.running_versions(&key).await, vec![(1, 1), (2, 1)]);
    assert!(group.group.pods.iter().all(|p| p.version == 1));

    // drift instance 1 off its node
    h.drain_events();
    h.engine
        .drift_node("node-a", Some("node-c"), Some((&key, Some(1))), false)
        .await
        .expect("queued");
    let group = h.group(&key).await;
    assert_eq!(group.group.pods[0].node_name, "node-c");
    assert_eq!(group.prev_state[0].node_name, "node-c");
    let moved: Vec<DependencyEventType> =
        h.drain_events().into_iter().map(|e| e.event_type).collect();
    assert_eq!(
        moved,
        vec![DependencyEventType::Remove, DependencyEventType::Add]
    );

    // an exited container is restarted by the next refresh
    let exited = group.group.pods[1].container_id.clone();
    assert!(h.cluster.exit_container(&exited, 1).await);
    h.engine.refresh_all(false).await;
    let group = h.group(&key).await;
    assert_ne!(group.group.pods[1].container_id, exited);
    assert_eq!(group.group.pods[1].restart_count, 1);
    assert_eq!(group.group.pods[1].node_name, "node-b");
    assert_eq!(group.group.state, RunState::Success);

    // a lost address is reported once per health check
    let first = group.group.pods[0].container_id.clone();
    assert!(h.cluster.clear_ip(&first).await);
    h.engine.refresh_all(false).await;
    h.engine.flush_pod_group(&key).await.expect("worker alive");
    assert_eq!(h.engine.check_health().await, vec![key.clone()]);
    let notification = h.notifications.try_recv().expect("notification");
    assert_eq!(notification.kind, NotifyKind::PodIpLost);
    assert_eq!(notification.instance_no, 1);
    assert!(h.notifications.try_recv().is_err());

    // removal tears everything down
    let store_key = format!("/podgroupd/pod_groups/{}/{}", key.namespace, key.name);
    assert!(h.store.get(&store_key).await.expect("readable").is_some());
    h.engine.remove_pod_group(&key).await.expect("queued");
    loop {
        let group = h.engine.inspect_pod_group(&key).await.expect("known");
        if group.group.state == RunState::Removed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.running_versions(&key).await.is_empty());
    assert!(h.store.get(&store_key).await.expect("readable").is_none());
    assert!(h.registry.is_empty());

    h.engine.refresh_all(false).await;
    assert!(h.engine.list_pod_groups().await.is_empty());
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[test(tokio::test)]
async fn restarted_engine_restores_groups_and_ports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key = GroupKey::new("shop", "shop.web");

    let first = Harness::new(dir.path());
    first.engine.new_pod_group(web_group(2)).await.expect("created");
    let before = first.group(&key).await;
    first.engine.shutdown(Duration::from_secs(5)).await;

    let second = Harness::new(dir.path());
    assert!(second.registry.is_empty());
    let loaded = second.engine.load_from_store().await.expect("store readable");

    assert_eq!(loaded, 1);
    assert_eq!(
        second.engine.inspect_pod_group(&key).await.expect("restored"),
        before
    );
    assert_eq!(
        second.registry.owner(9000).map(|p| p.proc_name),
        Some("shop.web".to_string())
    );

    // containers of the previous runtime are gone, a refresh redeploys them
    second.engine.refresh_all(true).await;
    let group = second.group(&key).await;
    assert_eq!(group.group.state, RunState::Success);
    assert!(group.group.pods.iter().all(|p| p.restart_count == 1));
    assert_eq!(second.running_versions(&key).await, vec![(1, 0), (2, 0)]);
    second.engine.shutdown(Duration::from_secs(5)).await;
}

#[test(tokio::test)]
async fn conflicting_group_fails_without_deploying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(dir.path());
    let web = GroupKey::new("shop", "shop.web");
    let admin = GroupKey::new("shop", "shop.admin");

    h.engine.new_pod_group(web_group(1)).await.expect("created");
    let mut admin_pod = web_pod("registry/admin:1");
    admin_pod.name = "shop.admin".to_string();
    h.engine
        .new_pod_group(PodGroupSpec::new(
            "shop",
            "shop.admin",
            admin_pod,
            2,
            RestartPolicy::Always,
        ))
        .await
        .expect("created");

    let group = h.group(&admin).await;
    assert_eq!(group.group.state, RunState::Fail);
    assert!(group.group.last_error.contains("port conflict"));
    assert!(h.running_versions(&admin).await.is_empty());
    assert_eq!(h.group(&web).await.group.state, RunState::Success);
    h.engine.shutdown(Duration::from_secs(5)).await;
}
