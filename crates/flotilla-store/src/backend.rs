use async_trait::async_trait;
use flotilla_domain::{Namespace, Node, NodeId, Pack, PackId, Pod, PodId, Workload, WorkloadId};

use crate::error::BackendError;

/// Durable persistence adapter consumed by [`crate::ClusterStore`].
///
/// Each method is transactional on its own: `create_*` fails with
/// [`BackendError::Conflict`] when the id exists, `update_*` with
/// [`BackendError::NotFound`] when it does not. Multi-record store
/// operations issue at most one call per record and are idempotent under
/// retry keyed by the record id.
#[async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    async fn create_node(&self, node: &Node) -> Result<(), BackendError>;
    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, BackendError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, BackendError>;
    async fn update_node(&self, node: &Node) -> Result<(), BackendError>;
    async fn delete_node(&self, id: &NodeId) -> Result<(), BackendError>;

    async fn create_pod(&self, pod: &Pod) -> Result<(), BackendError>;
    async fn get_pod(&self, id: &PodId) -> Result<Option<Pod>, BackendError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, BackendError>;
    async fn update_pod(&self, pod: &Pod) -> Result<(), BackendError>;
    async fn delete_pod(&self, id: &PodId) -> Result<(), BackendError>;

    async fn create_pack(&self, pack: &Pack) -> Result<(), BackendError>;
    async fn get_pack(&self, id: &PackId) -> Result<Option<Pack>, BackendError>;
    async fn list_packs(&self) -> Result<Vec<Pack>, BackendError>;
    async fn update_pack(&self, pack: &Pack) -> Result<(), BackendError>;
    async fn delete_pack(&self, id: &PackId) -> Result<(), BackendError>;

    async fn create_workload(&self, workload: &Workload) -> Result<(), BackendError>;
    async fn get_workload(&self, id: &WorkloadId) -> Result<Option<Workload>, BackendError>;
    async fn list_workloads(&self) -> Result<Vec<Workload>, BackendError>;
    async fn update_workload(&self, workload: &Workload) -> Result<(), BackendError>;
    async fn delete_workload(&self, id: &WorkloadId) -> Result<(), BackendError>;

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), BackendError>;
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, BackendError>;
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, BackendError>;
    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), BackendError>;
    async fn delete_namespace(&self, name: &str) -> Result<(), BackendError>;
}
