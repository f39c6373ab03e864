use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_domain::{check_placement, FilterReason, Node, NodeId, PodId, PodPhase, UnschedulableReason};
use flotilla_store::{ClusterEvent, ClusterStore, StoreError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::PendingQueue;
use crate::score::{score_node, ScoreWeights};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Parallel binding workers sharing the queue.
    pub workers: usize,
    /// Store transaction deadline for one bind attempt.
    pub bind_deadline: Duration,
    /// First re-queue delay after a failed pass.
    pub backoff_base: Duration,
    /// Ceiling for the re-queue delay.
    pub backoff_cap: Duration,
    pub weights: ScoreWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2),
            bind_deadline: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            weights: ScoreWeights::default(),
        }
    }
}

/// Binds pending pods to feasible nodes: filter, score, bind, with
/// re-queue-and-backoff when no candidate works out.
///
/// Pod creation is not the scheduler's job; it watches the store's event
/// stream for new pending pods and drains the shared queue.
pub struct Scheduler {
    store: Arc<ClusterStore>,
    queue: Arc<PendingQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<ClusterStore>, config: SchedulerConfig) -> Self {
        Scheduler { store, queue: Arc::new(PendingQueue::new()), config }
    }

    pub fn queue(&self) -> Arc<PendingQueue> {
        self.queue.clone()
    }

    /// Start the intake watcher and the binding workers. Returns once all
    /// loops have been spawned.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Pods that were already pending before this process started.
        for pod in self.store.pods().await {
            if pod.phase == PodPhase::Pending {
                self.queue.enqueue(pod.id.clone(), pod.priority);
            }
        }

        let intake = self.clone();
        let intake_cancel = cancel.clone();
        tokio::spawn(async move { intake.intake_loop(intake_cancel).await });

        info!(workers = self.config.workers, "scheduler started");
        for worker in 0..self.config.workers {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.worker_loop(worker, cancel).await });
        }
    }

    async fn intake_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.next() => {
                    let Some(event) = event else { return };
                    if let ClusterEvent::PodCreated { pod_id, .. } = event {
                        if let Some(pod) = self.store.pod(&pod_id).await {
                            if pod.phase == PodPhase::Pending {
                                self.queue.enqueue(pod_id, pod.priority);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "scheduler worker started");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Some((pod_id, priority)) = self.queue.pop_ready() {
                self.schedule_one(&pod_id, priority).await;
                continue;
            }
            let sleep_until = self
                .queue
                .next_wakeup()
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_millis(500));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.queue.wait() => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    /// One deterministic placement pass for one pod.
    pub async fn schedule_one(&self, pod_id: &PodId, priority: i32) {
        let Some(pod) = self.store.pod(pod_id).await else {
            return; // deleted while queued
        };
        if pod.phase != PodPhase::Pending {
            return; // already bound or terminated elsewhere
        }
        let Some(pack) = self.store.pack(&pod.pack_name, &pod.pack_version).await else {
            warn!(pod_id = %pod_id, pack = %pod.pack_name, version = %pod.pack_version,
                  "pack vanished; pod stays pending");
            self.report_unschedulable(pod_id, priority, UnschedulableReason::NoCompatibleNodes);
            return;
        };
        let Some(namespace) = self.store.namespace(&pod.namespace).await else {
            self.report_unschedulable(pod_id, priority, UnschedulableReason::NoCompatibleNodes);
            return;
        };

        let nodes = self.store.nodes().await;
        if nodes.is_empty() {
            self.report_unschedulable(pod_id, priority, UnschedulableReason::NoNodes);
            return;
        }

        let mut candidates: Vec<&Node> = Vec::new();
        let mut failures: Vec<FilterReason> = Vec::new();
        for node in &nodes {
            match check_placement(node, &pod, &pack, &namespace) {
                Ok(()) => candidates.push(node),
                Err(reason) => failures.push(reason),
            }
        }
        if candidates.is_empty() {
            let dominant = failures
                .iter()
                .max_by_key(|r| r.rank())
                .map(|r| r.category())
                .unwrap_or(UnschedulableReason::NoNodes);
            self.report_unschedulable(pod_id, priority, dominant);
            return;
        }

        // Placement accounting for the spread term.
        let all_pods = self.store.pods().await;
        let mut per_node: HashMap<NodeId, usize> = HashMap::new();
        let mut total_placed = 0usize;
        for p in &all_pods {
            if let Some(node_id) = &p.node_id {
                if p.phase.is_placed() {
                    *per_node.entry(node_id.clone()).or_default() += 1;
                    total_placed += 1;
                }
            }
        }

        let mut scored: Vec<(&Node, f64)> = candidates
            .into_iter()
            .map(|n| {
                (n, score_node(n, &pod, &per_node, total_placed, &self.config.weights))
            })
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        for (node, score) in &scored {
            match timeout(
                self.config.bind_deadline,
                self.store.bind_pod(pod_id, &node.id, Utc::now()),
            )
            .await
            {
                Ok(Ok(bound)) => {
                    debug!(
                        pod_id = %pod_id,
                        node_id = %node.id,
                        incarnation = bound.incarnation,
                        score,
                        "pod bound"
                    );
                    self.queue.clear_attempts(pod_id);
                    return;
                }
                // The atomic re-verify lost a race; try the next candidate.
                Ok(Err(StoreError::Infeasible { node: node_id, reason })) => {
                    debug!(pod_id = %pod_id, node_id = %node_id, reason = %reason, "bind re-verify failed");
                }
                Ok(Err(StoreError::QuotaExceeded(msg))) => {
                    warn!(pod_id = %pod_id, msg = %msg, "backend quota rejected the bind");
                    self.report_unschedulable(pod_id, priority, UnschedulableReason::QuotaExceeded);
                    return;
                }
                Ok(Err(StoreError::InvalidTransition { .. })) => {
                    return; // no longer pending; someone else resolved it
                }
                Ok(Err(e)) => {
                    warn!(pod_id = %pod_id, node_id = %node.id, error = %e, "bind failed; re-queueing");
                    self.store.counters().inc_schedule_retries();
                    self.requeue(pod_id, priority);
                    return;
                }
                Err(_) => {
                    warn!(pod_id = %pod_id, node_id = %node.id, "bind deadline exceeded; re-queueing");
                    self.store.counters().inc_schedule_retries();
                    self.requeue(pod_id, priority);
                    return;
                }
            }
        }

        // Every candidate was stolen between filter and bind.
        self.report_unschedulable(pod_id, priority, UnschedulableReason::InsufficientResources);
    }

    fn report_unschedulable(&self, pod_id: &PodId, priority: i32, reason: UnschedulableReason) {
        self.store.note_pod_unschedulable(pod_id, reason);
        let delay = self.requeue(pod_id, priority);
        debug!(pod_id = %pod_id, reason = %reason, retry_in_ms = delay.as_millis() as u64,
               "pod unschedulable");
    }

    fn requeue(&self, pod_id: &PodId, priority: i32) -> Duration {
        self.queue.requeue_after_backoff(
            pod_id.clone(),
            priority,
            self.config.backoff_base,
            self.config.backoff_cap,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_domain::{
        NodeCapabilities, NodeOwner, NodeRegistration, Pack, PackId, PackRuntime, PackVisibility,
        Pod, PriorityClass, Resources, RuntimeKind, SessionId, Taint, TaintEffect, Toleration,
        TolerationOperator,
    };
    use flotilla_store::MemoryBackend;
    use uuid::Uuid;

    async fn seeded() -> Arc<ClusterStore> {
        let store = Arc::new(ClusterStore::new(Arc::new(MemoryBackend::new())));
        store.create_namespace("default").await.unwrap();
        store
            .register_pack(Pack {
                id: PackId::new(Uuid::new_v4().to_string()),
                name: "app".into(),
                version: "1.0.0".into(),
                runtime: PackRuntime::ServerOnly,
                owner_id: "alice".into(),
                visibility: PackVisibility::Public,
                bundle_ref: "bundle://app/1.0.0".into(),
                description: None,
                min_runtime_version: None,
                metadata: Default::default(),
                registered_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    fn registration(name: &str) -> NodeRegistration {
        NodeRegistration {
            name: name.to_string(),
            runtime: RuntimeKind::Server,
            capabilities: NodeCapabilities { runtime_version: "20.0.0".into(), agent_build: None },
            allocatable: Resources { cpu_millis: 4000, memory_bytes: 8192, pods: 100, storage_bytes: 0 },
            labels: Default::default(),
            taints: vec![],
            owner: NodeOwner { user_id: "alice".into(), admin: false },
        }
    }

    fn pending_pod(id: &str) -> Pod {
        Pod {
            id: PodId::new(id),
            workload_id: None,
            pack_name: "app".into(),
            pack_version: "1.0.0".into(),
            namespace: "default".into(),
            requests: Resources { cpu_millis: 500, memory_bytes: 512, pods: 1, storage_bytes: 0 },
            limits: Resources::ZERO,
            tolerations: vec![],
            node_selector: Default::default(),
            preferred_labels: Default::default(),
            pinned_node: None,
            priority: PriorityClass::Normal.priority(),
            node_id: None,
            phase: PodPhase::Pending,
            incarnation: 0,
            created_by: "test".into(),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            stopped_at: None,
            last_reported_at: None,
            termination_reason: None,
            restart_count: 0,
        }
    }

    fn scheduler(store: Arc<ClusterStore>) -> Scheduler {
        Scheduler::new(store, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn places_a_pod_on_the_single_feasible_node() {
        let store = seeded().await;
        let node = store
            .register_node(registration("n1"), SessionId::new("s1"), Utc::now())
            .await
            .unwrap();
        store.create_pod(pending_pod("p1")).await.unwrap();

        let s = scheduler(store.clone());
        s.schedule_one(&PodId::new("p1"), 100).await;

        let pod = store.pod(&PodId::new("p1")).await.unwrap();
        assert_eq!(pod.phase, PodPhase::Scheduled);
        assert_eq!(pod.node_id.as_ref(), Some(&node.id));
        assert_eq!(pod.incarnation, 1);
        let n = store.node(&node.id).await.unwrap();
        assert_eq!(
            n.allocated,
            Resources { cpu_millis: 500, memory_bytes: 512, pods: 1, storage_bytes: 0 }
        );
    }

    #[tokio::test]
    async fn tainted_node_rejects_then_toleration_admits() {
        let store = seeded().await;
        let mut reg = registration("gpu-node");
        reg.taints.push(Taint {
            key: "dedicated".into(),
            value: Some("gpu".into()),
            effect: TaintEffect::NoSchedule,
        });
        store.register_node(reg, SessionId::new("s1"), Utc::now()).await.unwrap();

        store.create_pod(pending_pod("plain")).await.unwrap();
        let s = scheduler(store.clone());
        s.schedule_one(&PodId::new("plain"), 100).await;
        assert_eq!(store.pod(&PodId::new("plain")).await.unwrap().phase, PodPhase::Pending);
        assert_eq!(s.queue.len(), 1, "unschedulable pod is re-queued with backoff");

        let mut tolerant = pending_pod("tolerant");
        tolerant.tolerations.push(Toleration {
            key: "dedicated".into(),
            operator: TolerationOperator::Equal,
            value: Some("gpu".into()),
            effect: Some(TaintEffect::NoSchedule),
        });
        store.create_pod(tolerant).await.unwrap();
        s.schedule_one(&PodId::new("tolerant"), 100).await;
        assert_eq!(store.pod(&PodId::new("tolerant")).await.unwrap().phase, PodPhase::Scheduled);
    }

    #[tokio::test]
    async fn prefers_the_emptier_node_for_spread() {
        let store = seeded().await;
        let n1 = store
            .register_node(registration("n1"), SessionId::new("s1"), Utc::now())
            .await
            .unwrap();
        let n2 = store
            .register_node(registration("n2"), SessionId::new("s2"), Utc::now())
            .await
            .unwrap();

        let s = scheduler(store.clone());
        store.create_pod(pending_pod("p1")).await.unwrap();
        s.schedule_one(&PodId::new("p1"), 100).await;
        store.create_pod(pending_pod("p2")).await.unwrap();
        s.schedule_one(&PodId::new("p2"), 100).await;

        let first = store.pod(&PodId::new("p1")).await.unwrap().node_id.unwrap();
        let second = store.pod(&PodId::new("p2")).await.unwrap().node_id.unwrap();
        assert_ne!(first, second, "two equal nodes should each get one pod");
        assert!([&n1.id, &n2.id].contains(&&first));
        assert!([&n1.id, &n2.id].contains(&&second));
    }

    #[tokio::test]
    async fn no_nodes_reports_and_requeues() {
        let store = seeded().await;
        store.create_pod(pending_pod("p1")).await.unwrap();

        let mut events = store.subscribe();
        let s = scheduler(store.clone());
        s.schedule_one(&PodId::new("p1"), 100).await;

        assert_eq!(store.pod(&PodId::new("p1")).await.unwrap().phase, PodPhase::Pending);
        assert_eq!(s.queue.len(), 1);

        let mut saw_unschedulable = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.next()).await
        {
            if let ClusterEvent::PodUnschedulable { reason, .. } = event {
                assert_eq!(reason, UnschedulableReason::NoNodes);
                saw_unschedulable = true;
                break;
            }
        }
        assert!(saw_unschedulable);
    }

    #[tokio::test]
    async fn selector_mismatch_classifies_as_affinity() {
        let store = seeded().await;
        store.register_node(registration("n1"), SessionId::new("s1"), Utc::now()).await.unwrap();

        let mut picky = pending_pod("picky");
        picky.node_selector.insert("zone".into(), "mars".into());
        store.create_pod(picky).await.unwrap();

        let mut events = store.subscribe();
        let s = scheduler(store.clone());
        s.schedule_one(&PodId::new("picky"), 100).await;

        let mut reason_seen = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.next()).await
        {
            if let ClusterEvent::PodUnschedulable { reason, .. } = event {
                reason_seen = Some(reason);
                break;
            }
        }
        assert_eq!(reason_seen, Some(UnschedulableReason::AffinityNotMet));
    }
}
