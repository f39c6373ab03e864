use thiserror::Error;

/// Validation failure raised by the record types themselves, before any
/// store or backend state is touched.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid version string: {0}")]
    InvalidVersion(String),

    #[error("invalid resource request: {0}")]
    InvalidResourceRequest(String),
}
