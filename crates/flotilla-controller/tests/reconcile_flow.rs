use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use flotilla_controller::{ControllerConfig, WorkloadController};
use flotilla_domain::{
    NodeCapabilities, NodeId, NodeOwner, NodeRegistration, Pack, PackId, PackRuntime,
    PackVisibility, Pod, PodPhase, PodTemplate, PriorityClass, Resources, RuntimeKind, SessionId,
    TerminationReason, Workload, WorkloadId, WorkloadStatus,
};
use flotilla_store::{ClusterStore, MemoryBackend};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn pack(name: &str, version: &str) -> Pack {
    Pack {
        id: PackId::new(Uuid::new_v4().to_string()),
        name: name.to_string(),
        version: version.to_string(),
        runtime: PackRuntime::ServerOnly,
        owner_id: "alice".into(),
        visibility: PackVisibility::Public,
        bundle_ref: format!("bundle://{name}/{version}"),
        description: None,
        min_runtime_version: None,
        metadata: Default::default(),
        registered_at: Utc::now(),
    }
}

fn workload(name: &str, replicas: u32, version: &str, follow_latest: bool) -> Workload {
    Workload {
        id: WorkloadId::new(format!("w-{name}")),
        name: name.to_string(),
        namespace: "default".into(),
        pack_name: "app".into(),
        pack_version: version.to_string(),
        follow_latest,
        replicas,
        template: PodTemplate {
            requests: Resources { cpu_millis: 100, memory_bytes: 128, pods: 1, storage_bytes: 0 },
            ..Default::default()
        },
        priority_class: PriorityClass::Normal,
        status: WorkloadStatus::Active,
        observed: Default::default(),
        crash_loop: Default::default(),
        template_hash: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

async fn seeded() -> Arc<ClusterStore> {
    let store = Arc::new(ClusterStore::new(Arc::new(MemoryBackend::new())));
    store.create_namespace("default").await.unwrap();
    store.register_pack(pack("app", "1.0.0")).await.unwrap();
    store
}

async fn add_node(store: &ClusterStore, name: &str) -> NodeId {
    store
        .register_node(
            NodeRegistration {
                name: name.to_string(),
                runtime: RuntimeKind::Server,
                capabilities: NodeCapabilities { runtime_version: "20.0.0".into(), agent_build: None },
                allocatable: Resources { cpu_millis: 8000, memory_bytes: 16384, pods: 50, storage_bytes: 0 },
                labels: Default::default(),
                taints: vec![],
                owner: NodeOwner { user_id: "alice".into(), admin: false },
            },
            SessionId::new(format!("sess-{name}")),
            Utc::now(),
        )
        .await
        .unwrap()
        .id
}

fn controller(store: Arc<ClusterStore>) -> WorkloadController {
    WorkloadController::new(store, ControllerConfig::default())
}

async fn active_pods(store: &ClusterStore, workload: &WorkloadId) -> Vec<Pod> {
    store
        .pods_of_workload(workload)
        .await
        .into_iter()
        .filter(|p| p.is_active())
        .collect()
}

/// Bind a pending pod to the node and walk it up to running.
async fn run_pod(store: &ClusterStore, pod: &Pod, node: &NodeId) {
    let bound = store.bind_pod(&pod.id, node, Utc::now()).await.unwrap();
    store
        .advance_pod_phase(&bound.id, bound.incarnation, PodPhase::Starting, None, Utc::now())
        .await
        .unwrap();
    store
        .record_pod_status(&bound.id, bound.incarnation, PodPhase::Running, None, 0, Utc::now())
        .await
        .unwrap();
}

#[tokio::test]
async fn scale_up_creates_pending_pods() {
    let store = seeded().await;
    let w = store.create_workload(workload("api", 3, "1.0.0", false)).await.unwrap();

    let ctl = controller(store.clone());
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 3);

    let pods = active_pods(&store, &w.id).await;
    assert_eq!(pods.len(), 3);
    assert!(pods.iter().all(|p| p.phase == PodPhase::Pending));

    // A second pass with the population satisfied creates nothing.
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 0);
}

#[tokio::test]
async fn scale_down_terminates_youngest_first() {
    let store = seeded().await;
    let node = add_node(&store, "n1").await;
    let w = store.create_workload(workload("api", 3, "1.0.0", false)).await.unwrap();

    let ctl = controller(store.clone());
    ctl.pass(Utc::now()).await.unwrap();
    for pod in active_pods(&store, &w.id).await {
        run_pod(&store, &pod, &node).await;
    }

    let mut w = store.workload(&w.id).await.unwrap();
    w.replicas = 1;
    let w = store.update_workload(w).await.unwrap();

    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_terminated, 2);
    let stopping = store
        .pods_of_workload(&w.id)
        .await
        .into_iter()
        .filter(|p| p.phase == PodPhase::Stopping)
        .count();
    assert_eq!(stopping, 2);
}

#[tokio::test]
async fn lease_loss_is_replaced_with_fresh_pods() {
    let store = seeded().await;
    let node = add_node(&store, "n1").await;
    let w = store.create_workload(workload("api", 2, "1.0.0", false)).await.unwrap();

    let ctl = controller(store.clone());
    ctl.pass(Utc::now()).await.unwrap();
    for pod in active_pods(&store, &w.id).await {
        run_pod(&store, &pod, &node).await;
    }

    // The node goes silent past its lease: both pods are revoked.
    store.mark_node_suspect(&node, Utc::now()).await.unwrap();
    let revoked = store.expire_lease(&node, Utc::now()).await.unwrap();
    assert_eq!(revoked.len(), 2);
    assert!(revoked
        .iter()
        .all(|p| p.termination_reason == Some(TerminationReason::NodeLost)));

    // The controller refills the population with new pending pods.
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 2);
    let pods = active_pods(&store, &w.id).await;
    assert_eq!(pods.len(), 2);
    assert!(pods.iter().all(|p| p.phase == PodPhase::Pending));
}

#[tokio::test]
async fn follow_latest_rolls_out_one_pod_at_a_time() {
    let store = seeded().await;
    let node = add_node(&store, "n1").await;
    let w = store.create_workload(workload("api", 2, "1.0.0", true)).await.unwrap();

    let ctl = controller(store.clone());
    ctl.pass(Utc::now()).await.unwrap();
    for pod in active_pods(&store, &w.id).await {
        run_pod(&store, &pod, &node).await;
    }

    store.register_pack(pack("app", "2.0.0")).await.unwrap();

    // Pass adopts v2 and creates exactly one newcomer.
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 1);
    assert_eq!(store.workload(&w.id).await.unwrap().pack_version, "2.0.0");

    // While the newcomer is still coming up nothing else moves.
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 0);
    assert_eq!(stats.pods_terminated, 0);

    for round in 0..2 {
        // Bring the pending newcomer to running.
        let newcomer = active_pods(&store, &w.id)
            .await
            .into_iter()
            .find(|p| p.pack_version == "2.0.0" && p.phase == PodPhase::Pending)
            .unwrap_or_else(|| panic!("round {round}: expected a pending v2 pod"));
        run_pod(&store, &newcomer, &node).await;

        // Only now is one old pod retired.
        let stats = ctl.pass(Utc::now()).await.unwrap();
        assert_eq!(stats.pods_terminated, 1, "round {round}");
        let stopping = store
            .pods_of_workload(&w.id)
            .await
            .into_iter()
            .find(|p| p.phase == PodPhase::Stopping)
            .expect("one old pod should be stopping");
        assert_eq!(stopping.pack_version, "1.0.0");

        // The agent confirms the stop; only then does the next newcomer
        // appear.
        store
            .record_pod_status(
                &stopping.id,
                stopping.incarnation,
                PodPhase::Stopped,
                None,
                0,
                Utc::now(),
            )
            .await
            .unwrap();
        let stats = ctl.pass(Utc::now()).await.unwrap();
        if round == 0 {
            assert_eq!(stats.pods_created, 1);
        } else {
            assert_eq!(stats.pods_created, 0, "rollout finished; nothing more to create");
        }
    }

    let pods = active_pods(&store, &w.id).await;
    assert_eq!(pods.len(), 2);
    assert!(pods.iter().all(|p| p.pack_version == "2.0.0"));
    assert!(pods.iter().all(|p| p.phase == PodPhase::Running));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_looping_version_is_held_back() {
    let store = seeded().await;
    let node = add_node(&store, "n1").await;
    store.register_pack(pack("app", "2.0.0")).await.unwrap();
    let w = store.create_workload(workload("api", 1, "2.0.0", false)).await.unwrap();

    let ctl = Arc::new(controller(store.clone()));
    let cancel = CancellationToken::new();
    tokio::spawn(ctl.clone().watch_failures(cancel.clone()));
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    for attempt in 0..3 {
        let stats = ctl.pass(Utc::now()).await.unwrap();
        assert_eq!(stats.pods_created, 1, "attempt {attempt}");
        let pod = active_pods(&store, &w.id).await.pop().unwrap();
        let bound = store.bind_pod(&pod.id, &node, Utc::now()).await.unwrap();
        store
            .advance_pod_phase(&bound.id, bound.incarnation, PodPhase::Starting, None, Utc::now())
            .await
            .unwrap();
        store
            .record_pod_status(
                &bound.id,
                bound.incarnation,
                PodPhase::Failed,
                Some(TerminationReason::Crashed),
                0,
                Utc::now(),
            )
            .await
            .unwrap();
        // Let the failure watcher ingest the transition event.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
    }

    let w = store.workload(&w.id).await.unwrap();
    assert_eq!(w.crash_loop.failed_version.as_deref(), Some("2.0.0"));
    assert_eq!(w.crash_loop.consecutive_failures, 3);
    let backoff_until = w.crash_loop.backoff_until.expect("backoff must be armed");
    assert!(backoff_until >= Utc::now() + Duration::seconds(25));

    // No replacement pod while the version sits in backoff.
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 0);
    assert!(active_pods(&store, &w.id).await.is_empty());

    // Once the clock passes the backoff, pods flow again.
    let later = backoff_until + Duration::seconds(1);
    let stats = ctl.pass(later).await.unwrap();
    assert_eq!(stats.pods_created, 1);

    cancel.cancel();
}

#[tokio::test]
async fn daemon_mode_covers_every_feasible_node() {
    let store = seeded().await;
    let n1 = add_node(&store, "n1").await;
    let n2 = add_node(&store, "n2").await;
    let w = store.create_workload(workload("agent", 0, "1.0.0", false)).await.unwrap();

    let ctl = controller(store.clone());
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 2);

    let pods = active_pods(&store, &w.id).await;
    let homes: Vec<_> = pods.iter().filter_map(|p| p.pinned_node.clone()).collect();
    assert!(homes.contains(&n1));
    assert!(homes.contains(&n2));

    // A node leaving the schedulable set loses its daemon replica.
    store.set_node_unschedulable(&n2, true).await.unwrap();
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_terminated, 1);
    let pods = active_pods(&store, &w.id).await;
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].pinned_node.as_ref(), Some(&n1));

    // A new feasible node gets covered on the next pass.
    let n3 = add_node(&store, "n3").await;
    let stats = ctl.pass(Utc::now()).await.unwrap();
    assert_eq!(stats.pods_created, 1);
    let pods = active_pods(&store, &w.id).await;
    assert!(pods.iter().any(|p| p.pinned_node.as_ref() == Some(&n3)));
}

#[tokio::test]
async fn observed_counts_track_running_and_updated() {
    let store = seeded().await;
    let node = add_node(&store, "n1").await;
    let w = store.create_workload(workload("api", 2, "1.0.0", false)).await.unwrap();

    let ctl = controller(store.clone());
    ctl.pass(Utc::now()).await.unwrap();
    let pods = active_pods(&store, &w.id).await;
    run_pod(&store, &pods[0], &node).await;

    ctl.pass(Utc::now()).await.unwrap();
    let w = store.workload(&w.id).await.unwrap();
    assert_eq!(w.observed.ready, 1);
    assert_eq!(w.observed.available, 1);
    assert_eq!(w.observed.updated, 2);
}
