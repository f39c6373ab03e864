use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::ids::PackId;
use crate::resources::RuntimeKind;

/// Which node runtimes a pack's bundle can execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackRuntime {
    ServerOnly,
    BrowserOnly,
    Universal,
}

impl PackRuntime {
    pub fn admits(&self, node: RuntimeKind) -> bool {
        match self {
            PackRuntime::ServerOnly => node == RuntimeKind::Server,
            PackRuntime::BrowserOnly => node == RuntimeKind::Browser,
            PackRuntime::Universal => true,
        }
    }
}

impl std::fmt::Display for PackRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackRuntime::ServerOnly => write!(f, "server-only"),
            PackRuntime::BrowserOnly => write!(f, "browser-only"),
            PackRuntime::Universal => write!(f, "universal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackVisibility {
    Private,
    Public,
}

/// A named, versioned executable bundle. (name, version) is unique across
/// the cluster. Immutable after registration except description, visibility
/// and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub id: PackId,
    pub name: String,
    pub version: String,
    pub runtime: PackRuntime,
    pub owner_id: String,
    pub visibility: PackVisibility,
    /// Opaque reference the agent uses to fetch the bundle.
    pub bundle_ref: String,
    pub description: Option<String>,
    /// Oldest node runtime version this bundle runs on.
    pub min_runtime_version: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl Pack {
    /// Reject a malformed pack before registration.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() {
            return Err(DomainError::InvalidId("pack name must not be empty".into()));
        }
        if self.version.is_empty() {
            return Err(DomainError::InvalidVersion(
                "pack version must not be empty".into(),
            ));
        }
        Ok(())
    }
}
