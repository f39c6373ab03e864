use flotilla_domain::{DomainError, NodeId, PodId, PodPhase};
use thiserror::Error;

/// Classified failure from the durable backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("backend quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error surfaced by the cluster store's typed operations. Callers rely on
/// the classification: `Conflict`/`NotFound`/`Forbidden`/`InvalidTransition`
/// map onto wire error codes, `BackendUnavailable` is retried by background
/// loops, and `CapacityExceeded` is fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("pod {pod}: invalid transition {from} -> {to}")]
    InvalidTransition { pod: PodId, from: PodPhase, to: PodPhase },

    #[error("pod {pod}: stale incarnation {got} (current {current})")]
    StaleIncarnation { pod: PodId, current: u64, got: u64 },

    /// The node no longer satisfies the placement filter; the caller should
    /// try the next candidate.
    #[error("node {node} infeasible: {reason}")]
    Infeasible { node: NodeId, reason: String },

    #[error("heartbeat for offline node {0}; re-registration required")]
    NodeOffline(NodeId),

    /// Accounting corruption: a bind would push `allocated` past
    /// `allocatable`. The store refuses further mutations once this fires.
    #[error("capacity invariant violated on node {0}")]
    CapacityExceeded(NodeId),

    #[error("store halted after invariant violation")]
    Halted,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DomainError> for StoreError {
    fn from(e: DomainError) -> Self {
        StoreError::Validation(e.to_string())
    }
}

impl From<BackendError> for StoreError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Conflict(m) => StoreError::Conflict(m),
            BackendError::NotFound(m) => StoreError::NotFound(m),
            BackendError::QuotaExceeded(m) => StoreError::QuotaExceeded(m),
            BackendError::Unavailable(m) => StoreError::BackendUnavailable(m),
            BackendError::Serialization(e) => StoreError::Serialization(e),
        }
    }
}
