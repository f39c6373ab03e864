use std::collections::HashMap;
use std::sync::Arc;

use flotilla_domain::{NodeId, PodId, PodPhase, TerminationReason};
use flotilla_proto::{Envelope, Message, PodAssignment, PodTerminate};
use flotilla_store::{ClusterEvent, ClusterStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::SessionRegistry;

/// Bridges store transitions to agent pushes: a fresh bind becomes a
/// `pod:assign` on the owning agent's session, a stop request becomes a
/// `pod:terminate`.
///
/// If the node has no live session the push is skipped; the lease engine
/// will either see the agent return (which re-syncs through heartbeats) or
/// revoke the pods.
pub struct CommandPusher {
    store: Arc<ClusterStore>,
    registry: Arc<SessionRegistry>,
}

impl CommandPusher {
    pub fn new(store: Arc<ClusterStore>, registry: Arc<SessionRegistry>) -> Self {
        CommandPusher { store, registry }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        info!("command pusher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("command pusher stopping");
                    return;
                }
                event = events.next() => {
                    let Some(event) = event else { return };
                    match event {
                        ClusterEvent::PodBound { pod_id, node_id, incarnation, .. } => {
                            self.push_assignment(&pod_id, &node_id, incarnation).await;
                        }
                        ClusterEvent::PodPhaseChanged {
                            pod_id, incarnation, to: PodPhase::Stopping, reason, ..
                        } => {
                            self.push_terminate(&pod_id, incarnation, reason).await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn push_assignment(&self, pod_id: &PodId, node_id: &NodeId, incarnation: u64) {
        let Some(pod) = self.store.pod(pod_id).await else { return };
        if pod.incarnation != incarnation || pod.phase != PodPhase::Scheduled {
            return; // superseded while the event sat in the channel
        }
        let Some(pack) = self.store.pack(&pod.pack_name, &pod.pack_version).await else {
            warn!(pod_id = %pod_id, "pack disappeared before assignment push");
            return;
        };
        let Some(handle) = self.registry.session_for_node(node_id).await else {
            debug!(pod_id = %pod_id, node_id = %node_id,
                   "no live session for node; assignment stays pending on the agent side");
            return;
        };

        let mut env = HashMap::new();
        env.insert("FLOTILLA_POD_ID".to_string(), pod.id.to_string());
        env.insert("FLOTILLA_POD_INCARNATION".to_string(), incarnation.to_string());
        env.insert("FLOTILLA_NAMESPACE".to_string(), pod.namespace.clone());
        env.insert("FLOTILLA_PACK".to_string(), format!("{}@{}", pod.pack_name, pod.pack_version));

        let assignment = PodAssignment {
            pod_id: pod.id.to_string(),
            incarnation,
            pack_name: pod.pack_name.clone(),
            pack_version: pod.pack_version.clone(),
            bundle_ref: pack.bundle_ref.clone(),
            namespace: pod.namespace.clone(),
            env,
            requests: pod.requests.into(),
            limits: pod.limits.into(),
        };
        let envelope = Envelope::reply(
            Message::PodAssign(assignment),
            Some(Uuid::new_v4().to_string()),
        );
        if handle.send(envelope).await.is_err() {
            debug!(pod_id = %pod_id, node_id = %node_id, "session closed mid-push");
        }
    }

    async fn push_terminate(
        &self,
        pod_id: &PodId,
        incarnation: u64,
        reason: Option<TerminationReason>,
    ) {
        let Some(pod) = self.store.pod(pod_id).await else { return };
        let Some(node_id) = pod.node_id.clone() else { return };
        let Some(handle) = self.registry.session_for_node(&node_id).await else {
            debug!(pod_id = %pod_id, node_id = %node_id,
                   "no live session for node; termination deferred to the lease engine");
            return;
        };

        let envelope = Envelope::reply(
            Message::PodTerminate(PodTerminate {
                pod_id: pod_id.to_string(),
                incarnation,
                reason: reason.unwrap_or(TerminationReason::UserRequested),
            }),
            Some(Uuid::new_v4().to_string()),
        );
        if handle.send(envelope).await.is_err() {
            debug!(pod_id = %pod_id, node_id = %node_id, "session closed mid-push");
        }
    }
}
