use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flotilla_domain::{NodeId, PodId, SessionId};
use flotilla_router::{GroupRegistry, RouteArbiter};
use flotilla_store::ClusterStore;

use crate::auth::{Principal, TokenVerifier};
use crate::registry::SessionRegistry;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded inbound queue per session; frames beyond it are dropped with
    /// a log event, never reordered.
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub max_frame_len: usize,
    /// Reply deadline for heartbeat handling.
    pub heartbeat_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            inbound_queue: 64,
            outbound_queue: 64,
            max_frame_len: flotilla_proto::MAX_FRAME_LEN,
            heartbeat_deadline: Duration::from_secs(5),
        }
    }
}

/// Shared collaborators handed to every connection.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<ClusterStore>,
    pub arbiter: Arc<RouteArbiter>,
    pub groups: Arc<GroupRegistry>,
    pub registry: Arc<SessionRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: SessionConfig,
}

/// What a session has proven itself to be. Until an identity is bound, only
/// the two claim messages are accepted.
#[derive(Debug)]
pub(crate) enum Identity {
    Agent { principal: Principal, nodes: HashSet<NodeId> },
    Pod { pod_id: PodId },
}

/// Per-connection mutable state, owned by the handler task.
pub(crate) struct SessionState {
    pub id: SessionId,
    pub identity: Option<Identity>,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        SessionState { id, identity: None }
    }

    pub fn owns_node(&self, node: &NodeId) -> bool {
        matches!(&self.identity, Some(Identity::Agent { nodes, .. }) if nodes.contains(node))
    }

    pub fn pod_claim(&self) -> Option<&PodId> {
        match &self.identity {
            Some(Identity::Pod { pod_id }) => Some(pod_id),
            _ => None,
        }
    }
}
