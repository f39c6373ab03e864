use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error code carried in `*:error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownType,
    Validation,
    Conflict,
    NotFound,
    Forbidden,
    InvalidState,
    /// The session has not completed its identity claim yet.
    NotRegistered,
    Unavailable,
    NoHealthyTarget,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::NoHealthyTarget => "NO_HEALTHY_TARGET",
            ErrorCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

/// Failure while framing or parsing wire traffic.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame is not a JSON object with a 'type' field")]
    MissingType,

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
