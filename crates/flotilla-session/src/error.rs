use flotilla_proto::{ErrorCode, WireError};
use flotilla_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Map a store failure onto the wire error code a peer receives.
pub fn error_code_for(e: &StoreError) -> ErrorCode {
    match e {
        StoreError::NotFound(_) => ErrorCode::NotFound,
        StoreError::Conflict(_) => ErrorCode::Conflict,
        StoreError::Validation(_) => ErrorCode::Validation,
        StoreError::Forbidden(_) => ErrorCode::Forbidden,
        StoreError::InvalidTransition { .. }
        | StoreError::StaleIncarnation { .. }
        | StoreError::NodeOffline(_) => ErrorCode::InvalidState,
        StoreError::QuotaExceeded(_)
        | StoreError::BackendUnavailable(_)
        | StoreError::CapacityExceeded(_)
        | StoreError::Halted => ErrorCode::Unavailable,
        StoreError::Infeasible { .. } | StoreError::Serialization(_) => ErrorCode::Internal,
    }
}
