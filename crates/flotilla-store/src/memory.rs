use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flotilla_domain::{Namespace, Node, NodeId, Pack, PackId, Pod, PodId, Workload, WorkloadId};
use tokio::sync::RwLock;

use crate::backend::ClusterBackend;
use crate::error::BackendError;

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<NodeId, Node>,
    pods: HashMap<PodId, Pod>,
    packs: HashMap<PackId, Pack>,
    workloads: HashMap<WorkloadId, Workload>,
    namespaces: HashMap<String, Namespace>,
}

/// In-memory implementation of [`ClusterBackend`].
///
/// All data is lost on process exit. Suitable for tests and single-node
/// deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterBackend for MemoryBackend {
    async fn create_node(&self, node: &Node) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if guard.nodes.contains_key(&node.id) {
            return Err(BackendError::Conflict(format!("node {}", node.id)));
        }
        guard.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, BackendError> {
        Ok(self.inner.read().await.nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, BackendError> {
        Ok(self.inner.read().await.nodes.values().cloned().collect())
    }

    async fn update_node(&self, node: &Node) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if !guard.nodes.contains_key(&node.id) {
            return Err(BackendError::NotFound(format!("node {}", node.id)));
        }
        guard.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<(), BackendError> {
        self.inner.write().await.nodes.remove(id);
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if guard.pods.contains_key(&pod.id) {
            return Err(BackendError::Conflict(format!("pod {}", pod.id)));
        }
        guard.pods.insert(pod.id.clone(), pod.clone());
        Ok(())
    }

    async fn get_pod(&self, id: &PodId) -> Result<Option<Pod>, BackendError> {
        Ok(self.inner.read().await.pods.get(id).cloned())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, BackendError> {
        Ok(self.inner.read().await.pods.values().cloned().collect())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if !guard.pods.contains_key(&pod.id) {
            return Err(BackendError::NotFound(format!("pod {}", pod.id)));
        }
        guard.pods.insert(pod.id.clone(), pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, id: &PodId) -> Result<(), BackendError> {
        self.inner.write().await.pods.remove(id);
        Ok(())
    }

    async fn create_pack(&self, pack: &Pack) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if guard.packs.contains_key(&pack.id) {
            return Err(BackendError::Conflict(format!("pack {}", pack.id)));
        }
        guard.packs.insert(pack.id.clone(), pack.clone());
        Ok(())
    }

    async fn get_pack(&self, id: &PackId) -> Result<Option<Pack>, BackendError> {
        Ok(self.inner.read().await.packs.get(id).cloned())
    }

    async fn list_packs(&self) -> Result<Vec<Pack>, BackendError> {
        Ok(self.inner.read().await.packs.values().cloned().collect())
    }

    async fn update_pack(&self, pack: &Pack) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if !guard.packs.contains_key(&pack.id) {
            return Err(BackendError::NotFound(format!("pack {}", pack.id)));
        }
        guard.packs.insert(pack.id.clone(), pack.clone());
        Ok(())
    }

    async fn delete_pack(&self, id: &PackId) -> Result<(), BackendError> {
        self.inner.write().await.packs.remove(id);
        Ok(())
    }

    async fn create_workload(&self, workload: &Workload) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if guard.workloads.contains_key(&workload.id) {
            return Err(BackendError::Conflict(format!("workload {}", workload.id)));
        }
        guard.workloads.insert(workload.id.clone(), workload.clone());
        Ok(())
    }

    async fn get_workload(&self, id: &WorkloadId) -> Result<Option<Workload>, BackendError> {
        Ok(self.inner.read().await.workloads.get(id).cloned())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, BackendError> {
        Ok(self.inner.read().await.workloads.values().cloned().collect())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if !guard.workloads.contains_key(&workload.id) {
            return Err(BackendError::NotFound(format!("workload {}", workload.id)));
        }
        guard.workloads.insert(workload.id.clone(), workload.clone());
        Ok(())
    }

    async fn delete_workload(&self, id: &WorkloadId) -> Result<(), BackendError> {
        self.inner.write().await.workloads.remove(id);
        Ok(())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if guard.namespaces.contains_key(&namespace.name) {
            return Err(BackendError::Conflict(format!("namespace {}", namespace.name)));
        }
        guard.namespaces.insert(namespace.name.clone(), namespace.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, BackendError> {
        Ok(self.inner.read().await.namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, BackendError> {
        Ok(self.inner.read().await.namespaces.values().cloned().collect())
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), BackendError> {
        let mut guard = self.inner.write().await;
        if !guard.namespaces.contains_key(&namespace.name) {
            return Err(BackendError::NotFound(format!("namespace {}", namespace.name)));
        }
        guard.namespaces.insert(namespace.name.clone(), namespace.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), BackendError> {
        self.inner.write().await.namespaces.remove(name);
        Ok(())
    }
}
