use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::ids::{NodeId, SessionId};
use crate::resources::{Resources, RuntimeKind, Taint};

// ── Node status ───────────────────────────────────────────────────────────────

/// Health state of a registered node.
///
/// Transitions (lease engine is the sole authority for suspect/offline):
///   Online → Suspect (missed heartbeats) → Offline (lease expired)
///   Suspect → Online (heartbeat inside the lease)
///   Online ↔ Draining (operator initiated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Suspect,
    Offline,
    Draining,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Suspect => "suspect",
            NodeStatus::Offline => "offline",
            NodeStatus::Draining => "draining",
        };
        write!(f, "{}", s)
    }
}

// ── Capabilities & ownership ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Version of the runtime the agent hosts pods in. Compared against a
    /// pack's declared minimum.
    pub runtime_version: String,
    /// Agent build identifier, informational only.
    pub agent_build: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOwner {
    pub user_id: String,
    /// Admin-owned nodes may host private packs of any owner.
    pub admin: bool,
}

// ── Node ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub runtime: RuntimeKind,
    pub capabilities: NodeCapabilities,
    /// Declared capacity. Invariant: `allocated` never exceeds this.
    pub allocatable: Resources,
    /// Sum of resource requests of the non-terminal pods bound here.
    pub allocated: Resources,
    pub labels: HashMap<String, String>,
    pub taints: Vec<Taint>,
    pub unschedulable: bool,
    pub status: NodeStatus,
    pub suspect_since: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    /// The live session this node registered through. None when disconnected.
    pub session_id: Option<SessionId>,
    pub owner: NodeOwner,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    /// Capacity still available for new bindings.
    pub fn remaining(&self) -> Resources {
        self.allocatable.saturating_sub(&self.allocated)
    }

    /// Nodes in these states keep logical ownership of their pods.
    pub fn holds_pods(&self) -> bool {
        matches!(self.status, NodeStatus::Online | NodeStatus::Suspect)
    }
}

/// The registration payload an agent announces itself with. The control
/// plane assigns the id; re-registration after lease loss gets a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub name: String,
    pub runtime: RuntimeKind,
    pub capabilities: NodeCapabilities,
    pub allocatable: Resources,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub owner: NodeOwner,
}

impl NodeRegistration {
    /// Reject a bad announcement before any record is created.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() {
            return Err(DomainError::InvalidId("node name must not be empty".into()));
        }
        if self.allocatable.pods == 0 {
            return Err(DomainError::InvalidResourceRequest(
                "allocatable.pods must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Namespace ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespacePhase {
    Active,
    /// No new pods may be scheduled into it; existing pods drain out.
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub phase: NamespacePhase,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Namespace { name: name.into(), phase: NamespacePhase::Active }
    }
}
