use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flotilla_domain::{
    check_placement, compare_versions, Namespace, NamespacePhase, Node, NodeId, NodeRegistration,
    NodeStatus, Pack, PackId, Pod, PodId, PodPhase, SessionId, TerminationReason,
    UnschedulableReason, Workload, WorkloadId,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::ClusterBackend;
use crate::error::StoreError;
use crate::events::{ClusterEvent, EventStream};
use crate::hash::compute_template_hash;
use crate::metrics::StoreCounters;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<NodeId, Node>,
    pods: HashMap<PodId, Pod>,
    packs: HashMap<PackId, Pack>,
    workloads: HashMap<WorkloadId, Workload>,
    namespaces: HashMap<String, Namespace>,
}

/// Outcome of a heartbeat ingest.
#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub node: Node,
    /// True when the heartbeat pulled the node back from suspect.
    pub recovered: bool,
}

/// Process-wide authoritative cache of cluster records, backed by a
/// pluggable durable adapter.
///
/// Every mutation is a typed operation: validate, mutate a copy, write the
/// backend, then commit the copy to the cache and publish a transition
/// event. Readers observe either the pre- or post-state of an operation,
/// never a partial record. A backend rejection leaves the cache untouched.
pub struct ClusterStore {
    backend: Arc<dyn ClusterBackend>,
    inner: RwLock<Inner>,
    events: broadcast::Sender<ClusterEvent>,
    counters: Arc<StoreCounters>,
    halted: AtomicBool,
}

impl ClusterStore {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        ClusterStore {
            backend,
            inner: RwLock::new(Inner::default()),
            events,
            counters: Arc::new(StoreCounters::default()),
            halted: AtomicBool::new(false),
        }
    }

    /// Invalidate the cache and reload every record from the backend.
    /// Called once at startup before any other operation.
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        let nodes = self.backend.list_nodes().await?;
        let pods = self.backend.list_pods().await?;
        let packs = self.backend.list_packs().await?;
        let workloads = self.backend.list_workloads().await?;
        let namespaces = self.backend.list_namespaces().await?;

        let mut guard = self.inner.write().await;
        guard.nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        guard.pods = pods.into_iter().map(|p| (p.id.clone(), p)).collect();
        guard.packs = packs.into_iter().map(|p| (p.id.clone(), p)).collect();
        guard.workloads = workloads.into_iter().map(|w| (w.id.clone(), w)).collect();
        guard.namespaces = namespaces.into_iter().map(|n| (n.name.clone(), n)).collect();
        debug!(
            nodes = guard.nodes.len(),
            pods = guard.pods.len(),
            packs = guard.packs.len(),
            workloads = guard.workloads.len(),
            "store hydrated from backend"
        );
        Ok(())
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe(), self.counters.clone())
    }

    pub fn counters(&self) -> Arc<StoreCounters> {
        self.counters.clone()
    }

    fn emit(&self, event: ClusterEvent) {
        // Fire-and-forget: no subscriber is fine, a full channel lags the
        // slowest subscriber instead of blocking us.
        let _ = self.events.send(event);
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(StoreError::Halted);
        }
        Ok(())
    }

    fn halt(&self, node: &NodeId) -> StoreError {
        self.halted.store(true, Ordering::SeqCst);
        warn!(node_id = %node, "capacity invariant violated; store halted");
        StoreError::CapacityExceeded(node.clone())
    }

    // ── Nodes ─────────────────────────────────────────────────────────────

    /// Admit a new node announced over `session`. The store assigns the id;
    /// a node returning after lease loss registers as a fresh identity.
    pub async fn register_node(
        &self,
        registration: NodeRegistration,
        session: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError> {
        self.ensure_running()?;
        registration.validate()?;

        let node = Node {
            id: NodeId::new(Uuid::new_v4().to_string()),
            name: registration.name,
            runtime: registration.runtime,
            capabilities: registration.capabilities,
            allocatable: registration.allocatable,
            allocated: flotilla_domain::Resources::ZERO,
            labels: registration.labels,
            taints: registration.taints,
            unschedulable: false,
            status: NodeStatus::Online,
            suspect_since: None,
            last_heartbeat: now,
            session_id: Some(session),
            owner: registration.owner,
            registered_at: now,
        };

        let mut guard = self.inner.write().await;
        self.backend.create_node(&node).await?;
        guard.nodes.insert(node.id.clone(), node.clone());
        drop(guard);

        self.emit(ClusterEvent::NodeRegistered {
            id: Uuid::new_v4(),
            at: now,
            node_id: node.id.clone(),
            name: node.name.clone(),
        });
        Ok(node)
    }

    /// Ingest a heartbeat. A suspect node inside its lease returns to
    /// online with its pods intact; an offline node is told to re-register.
    pub async fn heartbeat(
        &self,
        node_id: &NodeId,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatReport, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let node = guard
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        if node.status == NodeStatus::Offline {
            return Err(StoreError::NodeOffline(node_id.clone()));
        }

        let mut updated = node.clone();
        let recovered = updated.status == NodeStatus::Suspect;
        if recovered {
            updated.status = NodeStatus::Online;
            updated.suspect_since = None;
        }
        if at > updated.last_heartbeat {
            updated.last_heartbeat = at;
        }

        self.backend.update_node(&updated).await?;
        guard.nodes.insert(node_id.clone(), updated.clone());
        drop(guard);

        if recovered {
            self.emit(ClusterEvent::NodeRecovered {
                id: Uuid::new_v4(),
                at,
                node_id: node_id.clone(),
            });
        }
        Ok(HeartbeatReport { node: updated, recovered })
    }

    /// Phase A of the lease pass: an online node that missed its heartbeat
    /// window becomes suspect. Its pods are untouched.
    pub async fn mark_node_suspect(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let node = guard
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        if node.status != NodeStatus::Online {
            return Err(StoreError::Conflict(format!(
                "node {} is {}, not online",
                node_id, node.status
            )));
        }

        let mut updated = node.clone();
        updated.status = NodeStatus::Suspect;
        updated.suspect_since = Some(now);

        self.backend.update_node(&updated).await?;
        guard.nodes.insert(node_id.clone(), updated.clone());
        drop(guard);

        self.emit(ClusterEvent::NodeSuspect {
            id: Uuid::new_v4(),
            at: now,
            node_id: node_id.clone(),
        });
        Ok(updated)
    }

    /// Phase B of the lease pass: a suspect node whose lease ran out goes
    /// offline and every pod it held is revoked with reason `node_lost`.
    /// Returns the revoked pods so the caller can log them.
    pub async fn expire_lease(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pod>, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let node = guard
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        if node.status != NodeStatus::Suspect {
            return Err(StoreError::Conflict(format!(
                "node {} is {}, not suspect",
                node_id, node.status
            )));
        }

        let mut updated = node.clone();
        updated.status = NodeStatus::Offline;
        updated.session_id = None;
        updated.suspect_since = None;
        updated.allocated = flotilla_domain::Resources::ZERO;

        let mut revoked: Vec<Pod> = guard
            .pods
            .values()
            .filter(|p| p.node_id.as_ref() == Some(node_id) && p.is_active())
            .cloned()
            .collect();
        for pod in &mut revoked {
            pod.incarnation += 1;
            pod.phase = PodPhase::Failed;
            pod.termination_reason = Some(TerminationReason::NodeLost);
            pod.stopped_at = Some(now);
            pod.node_id = None;
        }

        self.backend.update_node(&updated).await?;
        for pod in &revoked {
            self.backend.update_pod(pod).await?;
        }
        guard.nodes.insert(node_id.clone(), updated);
        for pod in &revoked {
            guard.pods.insert(pod.id.clone(), pod.clone());
        }
        drop(guard);

        self.counters.inc_nodes_lost();
        self.emit(ClusterEvent::NodeLost {
            id: Uuid::new_v4(),
            at: now,
            node_id: node_id.clone(),
            pods_revoked: revoked.len(),
        });
        for pod in &revoked {
            self.counters.inc_pods_revoked();
            self.counters.inc_pods_failed();
            self.emit(ClusterEvent::PodRevoked {
                id: Uuid::new_v4(),
                at: now,
                pod_id: pod.id.clone(),
                node_id: Some(node_id.clone()),
                incarnation: pod.incarnation,
                reason: TerminationReason::NodeLost,
            });
        }
        Ok(revoked)
    }

    /// Begin or end a drain. A draining node keeps its pods and heartbeats
    /// but receives no new placements.
    pub async fn set_node_draining(
        &self,
        node_id: &NodeId,
        draining: bool,
    ) -> Result<Node, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let node = guard
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        let mut updated = node.clone();
        match (node.status, draining) {
            (NodeStatus::Online, true) => updated.status = NodeStatus::Draining,
            (NodeStatus::Draining, false) => updated.status = NodeStatus::Online,
            _ => {
                return Err(StoreError::Conflict(format!(
                    "node {} is {} and cannot change drain state",
                    node_id, node.status
                )))
            }
        }
        self.backend.update_node(&updated).await?;
        guard.nodes.insert(node_id.clone(), updated.clone());
        Ok(updated)
    }

    pub async fn set_node_unschedulable(
        &self,
        node_id: &NodeId,
        unschedulable: bool,
    ) -> Result<Node, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let node = guard
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        let mut updated = node.clone();
        updated.unschedulable = unschedulable;
        self.backend.update_node(&updated).await?;
        guard.nodes.insert(node_id.clone(), updated.clone());
        Ok(updated)
    }

    /// Clear the session association for every node registered through
    /// `session`. Called by the session layer on disconnect; the lease
    /// engine decides later whether the node is actually gone.
    pub async fn clear_node_session(&self, session: &SessionId) -> Result<Vec<NodeId>, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let affected: Vec<NodeId> = guard
            .nodes
            .values()
            .filter(|n| n.session_id.as_ref() == Some(session))
            .map(|n| n.id.clone())
            .collect();

        for id in &affected {
            let mut updated = guard.nodes[id].clone();
            updated.session_id = None;
            self.backend.update_node(&updated).await?;
            guard.nodes.insert(id.clone(), updated);
        }
        Ok(affected)
    }

    /// Remove a node explicitly. Active pods are revoked first.
    pub async fn deregister_node(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        if !guard.nodes.contains_key(node_id) {
            return Err(StoreError::NotFound(format!("node {}", node_id)));
        }

        let mut revoked: Vec<Pod> = guard
            .pods
            .values()
            .filter(|p| p.node_id.as_ref() == Some(node_id) && p.is_active())
            .cloned()
            .collect();
        for pod in &mut revoked {
            pod.incarnation += 1;
            pod.phase = PodPhase::Evicted;
            pod.termination_reason = Some(TerminationReason::Drained);
            pod.stopped_at = Some(now);
            pod.node_id = None;
        }

        for pod in &revoked {
            self.backend.update_pod(pod).await?;
        }
        self.backend.delete_node(node_id).await?;
        for pod in &revoked {
            guard.pods.insert(pod.id.clone(), pod.clone());
        }
        guard.nodes.remove(node_id);
        drop(guard);

        for pod in &revoked {
            self.counters.inc_pods_revoked();
            self.emit(ClusterEvent::PodRevoked {
                id: Uuid::new_v4(),
                at: now,
                pod_id: pod.id.clone(),
                node_id: Some(node_id.clone()),
                incarnation: pod.incarnation,
                reason: TerminationReason::Drained,
            });
        }
        self.emit(ClusterEvent::NodeDeregistered {
            id: Uuid::new_v4(),
            at: now,
            node_id: node_id.clone(),
        });
        Ok(())
    }

    // ── Packs ─────────────────────────────────────────────────────────────

    /// Register a pack version. (name, version) is unique: a duplicate
    /// registration is a conflict and leaves the original untouched.
    pub async fn register_pack(&self, pack: Pack) -> Result<Pack, StoreError> {
        self.ensure_running()?;
        pack.validate()?;

        let mut guard = self.inner.write().await;
        if guard
            .packs
            .values()
            .any(|p| p.name == pack.name && p.version == pack.version)
        {
            return Err(StoreError::Conflict(format!(
                "pack {}@{} already registered",
                pack.name, pack.version
            )));
        }

        self.backend.create_pack(&pack).await?;
        guard.packs.insert(pack.id.clone(), pack.clone());
        drop(guard);

        self.emit(ClusterEvent::PackRegistered {
            id: Uuid::new_v4(),
            at: pack.registered_at,
            pack_name: pack.name.clone(),
            version: pack.version.clone(),
        });
        Ok(pack)
    }

    /// Packs are immutable after registration except for these fields.
    pub async fn update_pack_details(
        &self,
        pack_id: &PackId,
        description: Option<String>,
        visibility: Option<flotilla_domain::PackVisibility>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<Pack, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let pack = guard
            .packs
            .get(pack_id)
            .ok_or_else(|| StoreError::NotFound(format!("pack {}", pack_id)))?;
        let mut updated = pack.clone();
        if let Some(d) = description {
            updated.description = Some(d);
        }
        if let Some(v) = visibility {
            updated.visibility = v;
        }
        if let Some(m) = metadata {
            updated.metadata = m;
        }
        self.backend.update_pack(&updated).await?;
        guard.packs.insert(pack_id.clone(), updated.clone());
        Ok(updated)
    }

    // ── Namespaces ────────────────────────────────────────────────────────

    pub async fn create_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        if guard.namespaces.contains_key(name) {
            return Err(StoreError::Conflict(format!("namespace {}", name)));
        }
        let namespace = Namespace::new(name);
        self.backend.create_namespace(&namespace).await?;
        guard.namespaces.insert(name.to_string(), namespace.clone());
        Ok(namespace)
    }

    pub async fn set_namespace_phase(
        &self,
        name: &str,
        phase: NamespacePhase,
    ) -> Result<Namespace, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let namespace = guard
            .namespaces
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("namespace {}", name)))?;
        let mut updated = namespace.clone();
        updated.phase = phase;
        self.backend.update_namespace(&updated).await?;
        guard.namespaces.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    // ── Pods ──────────────────────────────────────────────────────────────

    /// Admit a new pending pod. The pack and the namespace must exist.
    pub async fn create_pod(&self, pod: Pod) -> Result<Pod, StoreError> {
        self.ensure_running()?;
        if pod.phase != PodPhase::Pending || pod.node_id.is_some() {
            return Err(StoreError::Validation(
                "new pods must be pending and unbound".into(),
            ));
        }

        let mut guard = self.inner.write().await;
        if !guard.namespaces.contains_key(&pod.namespace) {
            return Err(StoreError::Validation(format!(
                "namespace {} does not exist",
                pod.namespace
            )));
        }
        if !guard
            .packs
            .values()
            .any(|p| p.name == pod.pack_name && p.version == pod.pack_version)
        {
            return Err(StoreError::Validation(format!(
                "pack {}@{} is not registered",
                pod.pack_name, pod.pack_version
            )));
        }

        self.backend.create_pod(&pod).await?;
        guard.pods.insert(pod.id.clone(), pod.clone());
        drop(guard);

        self.emit(ClusterEvent::PodCreated {
            id: Uuid::new_v4(),
            at: pod.created_at,
            pod_id: pod.id.clone(),
            workload_id: pod.workload_id.clone(),
        });
        Ok(pod)
    }

    /// Bind a pending pod to a node in one atomic mutation: the placement
    /// filter is re-verified against current state (other binds may have
    /// raced), resources are debited, the incarnation advances and the pod
    /// becomes scheduled.
    pub async fn bind_pod(
        &self,
        pod_id: &PodId,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Pod, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let pod = guard
            .pods
            .get(pod_id)
            .ok_or_else(|| StoreError::NotFound(format!("pod {}", pod_id)))?;
        if pod.phase != PodPhase::Pending {
            return Err(StoreError::InvalidTransition {
                pod: pod_id.clone(),
                from: pod.phase,
                to: PodPhase::Scheduled,
            });
        }
        let node = guard
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        let pack = guard
            .packs
            .values()
            .find(|p| p.name == pod.pack_name && p.version == pod.pack_version)
            .ok_or_else(|| {
                StoreError::NotFound(format!("pack {}@{}", pod.pack_name, pod.pack_version))
            })?;
        let namespace = guard
            .namespaces
            .get(&pod.namespace)
            .ok_or_else(|| StoreError::NotFound(format!("namespace {}", pod.namespace)))?;

        if let Err(reason) = check_placement(node, pod, pack, namespace) {
            return Err(StoreError::Infeasible {
                node: node_id.clone(),
                reason: reason.to_string(),
            });
        }

        let mut bound_node = node.clone();
        bound_node.allocated = bound_node
            .allocated
            .checked_add(&pod.requests)
            .ok_or_else(|| self.halt(node_id))?;
        if !bound_node.allocatable.covers(&bound_node.allocated) {
            return Err(self.halt(node_id));
        }

        let mut bound = pod.clone();
        bound.node_id = Some(node_id.clone());
        bound.incarnation += 1;
        bound.phase = PodPhase::Scheduled;
        bound.scheduled_at = Some(now);

        self.backend.update_node(&bound_node).await?;
        self.backend.update_pod(&bound).await?;
        guard.nodes.insert(node_id.clone(), bound_node);
        guard.pods.insert(pod_id.clone(), bound.clone());
        drop(guard);

        self.counters.inc_pods_scheduled();
        self.emit(ClusterEvent::PodBound {
            id: Uuid::new_v4(),
            at: now,
            pod_id: pod_id.clone(),
            node_id: node_id.clone(),
            incarnation: bound.incarnation,
        });
        Ok(bound)
    }

    /// Advance a pod along the ordinary state machine. The incarnation must
    /// match: commands and reports for an older placement are stale and
    /// rejected. Advancing to the current phase is a no-op, which makes
    /// command replay harmless.
    pub async fn advance_pod_phase(
        &self,
        pod_id: &PodId,
        incarnation: u64,
        to: PodPhase,
        reason: Option<TerminationReason>,
        now: DateTime<Utc>,
    ) -> Result<Pod, StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let pod = guard
            .pods
            .get(pod_id)
            .ok_or_else(|| StoreError::NotFound(format!("pod {}", pod_id)))?;
        if pod.incarnation != incarnation {
            return Err(StoreError::StaleIncarnation {
                pod: pod_id.clone(),
                current: pod.incarnation,
                got: incarnation,
            });
        }
        if pod.phase == to {
            return Ok(pod.clone());
        }
        if !pod.phase.can_advance_to(to) {
            return Err(StoreError::InvalidTransition {
                pod: pod_id.clone(),
                from: pod.phase,
                to,
            });
        }

        let from = pod.phase;
        let mut updated = pod.clone();
        updated.phase = to;
        if reason.is_some() {
            updated.termination_reason = reason;
        }
        if to == PodPhase::Running {
            updated.started_at = Some(now);
        }

        let released_node = if to.is_terminal() {
            updated.stopped_at = Some(now);
            let node_id = updated.node_id.take();
            match node_id {
                Some(id) => {
                    let mut node = guard
                        .nodes
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
                    node.allocated = node.allocated.saturating_sub(&updated.requests);
                    Some(node)
                }
                None => None,
            }
        } else {
            None
        };

        if let Some(node) = &released_node {
            self.backend.update_node(node).await?;
        }
        self.backend.update_pod(&updated).await?;
        if let Some(node) = released_node {
            guard.nodes.insert(node.id.clone(), node);
        }
        guard.pods.insert(pod_id.clone(), updated.clone());
        drop(guard);

        if to == PodPhase::Failed {
            self.counters.inc_pods_failed();
        }
        self.emit(ClusterEvent::PodPhaseChanged {
            id: Uuid::new_v4(),
            at: now,
            pod_id: pod_id.clone(),
            incarnation,
            from,
            to,
            reason: updated.termination_reason,
        });
        Ok(updated)
    }

    /// Ingest a `pod:status` report from the owning agent. Timestamps are
    /// refreshed even when the phase is unchanged; a stale incarnation is
    /// surfaced so the session layer can discard the report.
    pub async fn record_pod_status(
        &self,
        pod_id: &PodId,
        incarnation: u64,
        phase: PodPhase,
        reason: Option<TerminationReason>,
        restart_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Pod, StoreError> {
        self.ensure_running()?;
        {
            let mut guard = self.inner.write().await;
            let pod = guard
                .pods
                .get(pod_id)
                .ok_or_else(|| StoreError::NotFound(format!("pod {}", pod_id)))?;
            if pod.incarnation != incarnation {
                return Err(StoreError::StaleIncarnation {
                    pod: pod_id.clone(),
                    current: pod.incarnation,
                    got: incarnation,
                });
            }
            let mut updated = pod.clone();
            updated.last_reported_at = Some(now);
            updated.restart_count = updated.restart_count.max(restart_count);
            self.backend.update_pod(&updated).await?;
            guard.pods.insert(pod_id.clone(), updated.clone());
            if updated.phase == phase {
                return Ok(updated);
            }
        }
        self.advance_pod_phase(pod_id, incarnation, phase, reason, now).await
    }

    /// Force a pod out of service from any non-terminal phase, bypassing
    /// the ordinary state machine. Used by lease expiry (`Failed` /
    /// `node_lost`) and by the controller for pods that never reached
    /// running. Already-terminal pods are left untouched.
    pub async fn revoke_pod(
        &self,
        pod_id: &PodId,
        to: PodPhase,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<Pod, StoreError> {
        self.ensure_running()?;
        if !to.is_terminal() {
            return Err(StoreError::Validation(format!(
                "revocation target {} is not terminal",
                to
            )));
        }

        let mut guard = self.inner.write().await;
        let pod = guard
            .pods
            .get(pod_id)
            .ok_or_else(|| StoreError::NotFound(format!("pod {}", pod_id)))?;
        if pod.phase.is_terminal() {
            return Ok(pod.clone());
        }

        let mut updated = pod.clone();
        updated.incarnation += 1;
        updated.phase = to;
        updated.termination_reason = Some(reason);
        updated.stopped_at = Some(now);
        let prior_node = updated.node_id.take();

        let released_node = match &prior_node {
            Some(id) => {
                let mut node = guard
                    .nodes
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
                node.allocated = node.allocated.saturating_sub(&updated.requests);
                Some(node)
            }
            None => None,
        };

        if let Some(node) = &released_node {
            self.backend.update_node(node).await?;
        }
        self.backend.update_pod(&updated).await?;
        if let Some(node) = released_node {
            guard.nodes.insert(node.id.clone(), node);
        }
        guard.pods.insert(pod_id.clone(), updated.clone());
        drop(guard);

        self.counters.inc_pods_revoked();
        if to == PodPhase::Failed {
            self.counters.inc_pods_failed();
        }
        self.emit(ClusterEvent::PodRevoked {
            id: Uuid::new_v4(),
            at: now,
            pod_id: pod_id.clone(),
            node_id: prior_node,
            incarnation: updated.incarnation,
            reason,
        });
        Ok(updated)
    }

    /// Remove a terminal or never-bound pod record.
    pub async fn delete_pod(&self, pod_id: &PodId) -> Result<(), StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        let pod = guard
            .pods
            .get(pod_id)
            .ok_or_else(|| StoreError::NotFound(format!("pod {}", pod_id)))?;
        if pod.is_active() && pod.phase != PodPhase::Pending {
            return Err(StoreError::Conflict(format!(
                "pod {} is {} and cannot be deleted",
                pod_id, pod.phase
            )));
        }
        self.backend.delete_pod(pod_id).await?;
        guard.pods.remove(pod_id);
        Ok(())
    }

    /// Publish an unschedulable verdict for a pending pod. Event only; the
    /// pod record is unchanged and stays in the queue.
    pub fn note_pod_unschedulable(&self, pod_id: &PodId, reason: UnschedulableReason) {
        self.emit(ClusterEvent::PodUnschedulable {
            id: Uuid::new_v4(),
            at: Utc::now(),
            pod_id: pod_id.clone(),
            reason,
        });
    }

    // ── Workloads ─────────────────────────────────────────────────────────

    pub async fn create_workload(&self, mut workload: Workload) -> Result<Workload, StoreError> {
        self.ensure_running()?;
        workload.validate()?;

        let mut guard = self.inner.write().await;
        if !guard.namespaces.contains_key(&workload.namespace) {
            return Err(StoreError::Validation(format!(
                "namespace {} does not exist",
                workload.namespace
            )));
        }
        if guard
            .workloads
            .values()
            .any(|w| w.namespace == workload.namespace && w.name == workload.name)
        {
            return Err(StoreError::Conflict(format!(
                "workload {}/{} already exists",
                workload.namespace, workload.name
            )));
        }
        workload.template_hash = Some(compute_template_hash(&workload.template));

        self.backend.create_workload(&workload).await?;
        guard.workloads.insert(workload.id.clone(), workload.clone());
        drop(guard);

        self.emit(ClusterEvent::WorkloadCreated {
            id: Uuid::new_v4(),
            at: workload.created_at,
            workload_id: workload.id.clone(),
            name: workload.name.clone(),
        });
        Ok(workload)
    }

    /// Persist a controller-side mutation of a workload (target version,
    /// observed counts, crash-loop state, …). Refreshes the template hash.
    pub async fn update_workload(&self, mut workload: Workload) -> Result<Workload, StoreError> {
        self.ensure_running()?;
        workload.template_hash = Some(compute_template_hash(&workload.template));
        workload.updated_at = Utc::now();

        let mut guard = self.inner.write().await;
        if !guard.workloads.contains_key(&workload.id) {
            return Err(StoreError::NotFound(format!("workload {}", workload.id)));
        }
        self.backend.update_workload(&workload).await?;
        guard.workloads.insert(workload.id.clone(), workload.clone());
        Ok(workload)
    }

    /// Remove a workload record. Its pods must already be gone or terminal.
    pub async fn remove_workload(&self, workload_id: &WorkloadId) -> Result<(), StoreError> {
        self.ensure_running()?;
        let mut guard = self.inner.write().await;
        if !guard.workloads.contains_key(workload_id) {
            return Err(StoreError::NotFound(format!("workload {}", workload_id)));
        }
        let live = guard
            .pods
            .values()
            .any(|p| p.workload_id.as_ref() == Some(workload_id) && p.is_active());
        if live {
            return Err(StoreError::Conflict(format!(
                "workload {} still has active pods",
                workload_id
            )));
        }
        self.backend.delete_workload(workload_id).await?;
        guard.workloads.remove(workload_id);
        drop(guard);

        self.emit(ClusterEvent::WorkloadDeleted {
            id: Uuid::new_v4(),
            at: Utc::now(),
            workload_id: workload_id.clone(),
        });
        Ok(())
    }

    /// Publish a stall verdict for a crash-looping workload version.
    pub fn note_workload_stalled(
        &self,
        workload_id: &WorkloadId,
        version: &str,
        consecutive_failures: u32,
    ) {
        self.emit(ClusterEvent::WorkloadStalled {
            id: Uuid::new_v4(),
            at: Utc::now(),
            workload_id: workload_id.clone(),
            version: version.to_string(),
            consecutive_failures,
        });
    }

    // ── Snapshot reads ────────────────────────────────────────────────────

    pub async fn node(&self, id: &NodeId) -> Option<Node> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    pub async fn pod(&self, id: &PodId) -> Option<Pod> {
        self.inner.read().await.pods.get(id).cloned()
    }

    pub async fn pods(&self) -> Vec<Pod> {
        self.inner.read().await.pods.values().cloned().collect()
    }

    pub async fn pods_of_workload(&self, id: &WorkloadId) -> Vec<Pod> {
        self.inner
            .read()
            .await
            .pods
            .values()
            .filter(|p| p.workload_id.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    pub async fn pods_on_node(&self, id: &NodeId) -> Vec<Pod> {
        self.inner
            .read()
            .await
            .pods
            .values()
            .filter(|p| p.node_id.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    pub async fn pack(&self, name: &str, version: &str) -> Option<Pack> {
        self.inner
            .read()
            .await
            .packs
            .values()
            .find(|p| p.name == name && p.version == version)
            .cloned()
    }

    pub async fn packs(&self) -> Vec<Pack> {
        self.inner.read().await.packs.values().cloned().collect()
    }

    /// Newest registered version of a pack by segment-wise version order.
    pub async fn latest_pack_version(&self, name: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .packs
            .values()
            .filter(|p| p.name == name)
            .map(|p| p.version.clone())
            .max_by(|a, b| compare_versions(a, b))
    }

    pub async fn workload(&self, id: &WorkloadId) -> Option<Workload> {
        self.inner.read().await.workloads.get(id).cloned()
    }

    pub async fn workloads(&self) -> Vec<Workload> {
        self.inner.read().await.workloads.values().cloned().collect()
    }

    pub async fn namespace(&self, name: &str) -> Option<Namespace> {
        self.inner.read().await.namespaces.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_domain::{
        NodeCapabilities, NodeOwner, PackRuntime, PackVisibility, PriorityClass, Resources,
        RuntimeKind,
    };
    use crate::memory::MemoryBackend;

    fn store() -> ClusterStore {
        ClusterStore::new(Arc::new(MemoryBackend::new()))
    }

    fn registration(name: &str) -> NodeRegistration {
        NodeRegistration {
            name: name.to_string(),
            runtime: RuntimeKind::Server,
            capabilities: NodeCapabilities {
                runtime_version: "20.0.0".into(),
                agent_build: None,
            },
            allocatable: Resources { cpu_millis: 4000, memory_bytes: 8192, pods: 100, storage_bytes: 0 },
            labels: Default::default(),
            taints: vec![],
            owner: NodeOwner { user_id: "alice".into(), admin: false },
        }
    }

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

    async fn seeded() -> (ClusterStore, Node) {
        let s = store();
        s.create_namespace("default").await.unwrap();
        s.register_pack(pack("app", "1.0.0")).await.unwrap();
        let node = s
            .register_node(registration("n1"), SessionId::new("sess-1"), Utc::now())
            .await
            .unwrap();
        (s, node)
    }

    #[tokio::test]
    async fn invalid_registration_is_rejected_before_any_write() {
        let s = store();
        let mut bad = registration("");
        bad.allocatable.pods = 0;
        let err = s
            .register_node(bad, SessionId::new("sess-1"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(s.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_pack_registration_conflicts() {
        let s = store();
        s.register_pack(pack("app", "1.0.0")).await.unwrap();
        let err = s.register_pack(pack("app", "1.0.0")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(s.packs().await.len(), 1);
    }

    #[tokio::test]
    async fn bind_debits_node_and_advances_incarnation() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();

        let bound = s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();
        assert_eq!(bound.phase, PodPhase::Scheduled);
        assert_eq!(bound.incarnation, 1);
        assert_eq!(bound.node_id.as_ref(), Some(&node.id));

        let n = s.node(&node.id).await.unwrap();
        assert_eq!(
            n.allocated,
            Resources { cpu_millis: 500, memory_bytes: 512, pods: 1, storage_bytes: 0 }
        );
    }

    #[tokio::test]
    async fn terminal_phase_releases_capacity_and_clears_node() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();
        s.advance_pod_phase(&PodId::new("p1"), 1, PodPhase::Starting, None, Utc::now())
            .await
            .unwrap();
        let failed = s
            .advance_pod_phase(
                &PodId::new("p1"),
                1,
                PodPhase::Failed,
                Some(TerminationReason::Crashed),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(failed.node_id.is_none());
        assert_eq!(s.node(&node.id).await.unwrap().allocated, Resources::ZERO);
    }

    #[tokio::test]
    async fn stale_incarnation_is_rejected() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();

        let err = s
            .advance_pod_phase(&PodId::new("p1"), 0, PodPhase::Starting, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleIncarnation { current: 1, got: 0, .. }));
    }

    #[tokio::test]
    async fn undeclared_transition_is_rejected() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();

        let err = s
            .advance_pod_phase(&PodId::new("p1"), 1, PodPhase::Running, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: PodPhase::Scheduled, to: PodPhase::Running, .. }
        ));
    }

    #[tokio::test]
    async fn repeated_advance_to_same_phase_is_noop() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();
        s.advance_pod_phase(&PodId::new("p1"), 1, PodPhase::Starting, None, Utc::now())
            .await
            .unwrap();

        let again = s
            .advance_pod_phase(&PodId::new("p1"), 1, PodPhase::Starting, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(again.phase, PodPhase::Starting);
    }

    #[tokio::test]
    async fn heartbeat_recovers_suspect_node_and_keeps_pods() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();

        s.mark_node_suspect(&node.id, Utc::now()).await.unwrap();
        let report = s.heartbeat(&node.id, Utc::now()).await.unwrap();
        assert!(report.recovered);
        assert_eq!(report.node.status, NodeStatus::Online);
        assert!(report.node.suspect_since.is_none());
        assert_eq!(s.pod(&PodId::new("p1")).await.unwrap().phase, PodPhase::Scheduled);
    }

    #[tokio::test]
    async fn heartbeat_replay_only_touches_last_heartbeat() {
        let (s, node) = seeded().await;
        let at = Utc::now();
        let first = s.heartbeat(&node.id, at).await.unwrap().node;
        let second = s.heartbeat(&node.id, at).await.unwrap().node;
        assert_eq!(first.last_heartbeat, second.last_heartbeat);
        assert_eq!(first.status, second.status);
        assert_eq!(first.allocated, second.allocated);
    }

    #[tokio::test]
    async fn heartbeat_for_offline_node_is_rejected() {
        let (s, node) = seeded().await;
        s.mark_node_suspect(&node.id, Utc::now()).await.unwrap();
        s.expire_lease(&node.id, Utc::now()).await.unwrap();

        let err = s.heartbeat(&node.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NodeOffline(_)));
    }

    #[tokio::test]
    async fn lease_expiry_revokes_every_active_pod() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.create_pod(pending_pod("p2")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();
        s.bind_pod(&PodId::new("p2"), &node.id, Utc::now()).await.unwrap();

        s.mark_node_suspect(&node.id, Utc::now()).await.unwrap();
        let revoked = s.expire_lease(&node.id, Utc::now()).await.unwrap();
        assert_eq!(revoked.len(), 2);

        for id in ["p1", "p2"] {
            let pod = s.pod(&PodId::new(id)).await.unwrap();
            assert_eq!(pod.phase, PodPhase::Failed);
            assert_eq!(pod.termination_reason, Some(TerminationReason::NodeLost));
            assert_eq!(pod.incarnation, 2);
            assert!(pod.node_id.is_none());
        }
        let n = s.node(&node.id).await.unwrap();
        assert_eq!(n.status, NodeStatus::Offline);
        assert!(n.session_id.is_none());
        assert_eq!(n.allocated, Resources::ZERO);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_once_terminal() {
        let (s, node) = seeded().await;
        s.create_pod(pending_pod("p1")).await.unwrap();
        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();

        let first = s
            .revoke_pod(&PodId::new("p1"), PodPhase::Failed, TerminationReason::ScaledDown, Utc::now())
            .await
            .unwrap();
        let second = s
            .revoke_pod(&PodId::new("p1"), PodPhase::Failed, TerminationReason::ScaledDown, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.incarnation, 2);
        assert_eq!(second.incarnation, 2, "second revoke must not advance anything");
    }

    #[tokio::test]
    async fn bind_reverifies_capacity_against_races() {
        let (s, node) = seeded().await;
        let mut big = pending_pod("p1");
        big.requests = Resources { cpu_millis: 3000, memory_bytes: 4096, pods: 1, storage_bytes: 0 };
        let mut big2 = pending_pod("p2");
        big2.requests = Resources { cpu_millis: 3000, memory_bytes: 4096, pods: 1, storage_bytes: 0 };
        s.create_pod(big).await.unwrap();
        s.create_pod(big2).await.unwrap();

        s.bind_pod(&PodId::new("p1"), &node.id, Utc::now()).await.unwrap();
        let err = s.bind_pod(&PodId::new("p2"), &node.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Infeasible { .. }));
    }

    #[tokio::test]
    async fn latest_pack_version_uses_segment_order() {
        let s = store();
        s.register_pack(pack("app", "1.9.0")).await.unwrap();
        s.register_pack(pack("app", "1.10.0")).await.unwrap();
        s.register_pack(pack("app", "1.2.0")).await.unwrap();
        assert_eq!(s.latest_pack_version("app").await.as_deref(), Some("1.10.0"));
    }
}
