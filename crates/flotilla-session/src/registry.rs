use std::collections::HashMap;

use flotilla_domain::{NodeId, SessionId};
use flotilla_proto::Envelope;
use tokio::sync::{mpsc, RwLock};

use crate::error::SessionError;

/// Cheap cloneable handle for pushing frames into a session's outbound
/// queue. The writer task behind the queue serializes actual socket writes.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    outbound: mpsc::Sender<Envelope>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbound: mpsc::Sender<Envelope>) -> Self {
        SessionHandle { id, outbound }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), SessionError> {
        self.outbound.send(envelope).await.map_err(|_| SessionError::Closed)
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionHandle>,
    /// Which live session each node registered through.
    node_sessions: HashMap<NodeId, SessionId>,
}

/// Live-session index. Nothing here survives a disconnect; durable node
/// state lives in the cluster store.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: SessionHandle) {
        self.inner.write().await.sessions.insert(handle.id.clone(), handle);
    }

    /// Drop the session and any node associations it held.
    pub async fn remove(&self, session: &SessionId) {
        let mut guard = self.inner.write().await;
        guard.sessions.remove(session);
        guard.node_sessions.retain(|_, s| s != session);
    }

    pub async fn bind_node(&self, node: NodeId, session: SessionId) {
        self.inner.write().await.node_sessions.insert(node, session);
    }

    pub async fn session_for_node(&self, node: &NodeId) -> Option<SessionHandle> {
        let guard = self.inner.read().await;
        let session = guard.node_sessions.get(node)?;
        guard.sessions.get(session).cloned()
    }

    pub async fn get(&self, session: &SessionId) -> Option<SessionHandle> {
        self.inner.read().await.sessions.get(session).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
