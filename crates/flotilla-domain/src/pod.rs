use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, PodId, WorkloadId};
use crate::resources::{Resources, Toleration};

// ── Phase state machine ───────────────────────────────────────────────────────

/// Lifecycle phase of a pod.
///
/// Transitions:
///   Pending → Scheduled → Starting → Running → Stopping → Stopped
///   Starting | Running → Failed
/// Revocation (lease expiry, forced teardown) moves a pod to Failed or
/// Evicted from any non-terminal phase; that path bypasses `can_advance_to`
/// and is only reachable through the store's revoke operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodPhase {
    Pending,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Evicted,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Stopped | PodPhase::Failed | PodPhase::Evicted)
    }

    /// Whether the ordinary state machine allows `self → next`.
    pub fn can_advance_to(&self, next: PodPhase) -> bool {
        use PodPhase::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    /// A pod in one of these phases occupies capacity on its node.
    pub fn is_placed(&self) -> bool {
        matches!(
            self,
            PodPhase::Scheduled | PodPhase::Starting | PodPhase::Running | PodPhase::Stopping
        )
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodPhase::Pending => "pending",
            PodPhase::Scheduled => "scheduled",
            PodPhase::Starting => "starting",
            PodPhase::Running => "running",
            PodPhase::Stopping => "stopping",
            PodPhase::Stopped => "stopped",
            PodPhase::Failed => "failed",
            PodPhase::Evicted => "evicted",
        };
        write!(f, "{}", s)
    }
}

// ── Termination & scheduling outcomes ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The owning node's lease expired.
    NodeLost,
    /// The bundle exited with a failure before or after reaching running.
    Crashed,
    /// The bundle ran to completion.
    Completed,
    /// Removed by the controller to meet a lower replica count.
    ScaledDown,
    /// Replaced by a newer pack version during a rollout.
    Superseded,
    /// The node left the schedulable set (drain or cordon).
    Drained,
    UserRequested,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::NodeLost => "node_lost",
            TerminationReason::Crashed => "crashed",
            TerminationReason::Completed => "completed",
            TerminationReason::ScaledDown => "scaled_down",
            TerminationReason::Superseded => "superseded",
            TerminationReason::Drained => "drained",
            TerminationReason::UserRequested => "user_requested",
        };
        write!(f, "{}", s)
    }
}

/// Why a pending pod could not be placed this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnschedulableReason {
    NoNodes,
    NoCompatibleNodes,
    InsufficientResources,
    TaintNotTolerated,
    AffinityNotMet,
    QuotaExceeded,
}

impl std::fmt::Display for UnschedulableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnschedulableReason::NoNodes => "no-nodes",
            UnschedulableReason::NoCompatibleNodes => "no-compatible-nodes",
            UnschedulableReason::InsufficientResources => "insufficient-resources",
            UnschedulableReason::TaintNotTolerated => "taint-not-tolerated",
            UnschedulableReason::AffinityNotMet => "affinity-not-met",
            UnschedulableReason::QuotaExceeded => "quota-exceeded",
        };
        write!(f, "{}", s)
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl PriorityClass {
    /// Numeric priority used for queue ordering. Higher schedules first.
    pub fn priority(&self) -> i32 {
        match self {
            PriorityClass::Low => 0,
            PriorityClass::Normal => 100,
            PriorityClass::High => 1000,
            PriorityClass::Critical => 10_000,
        }
    }
}

// ── Pod ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    /// Set when a workload controller owns this pod.
    pub workload_id: Option<WorkloadId>,
    pub pack_name: String,
    pub pack_version: String,
    pub namespace: String,
    pub requests: Resources,
    pub limits: Resources,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Soft placement preference: labels that raise a node's score but never
    /// exclude it.
    #[serde(default)]
    pub preferred_labels: HashMap<String, String>,
    /// Restrict placement to exactly this node. Daemon replicas are pinned
    /// to the node they cover.
    #[serde(default)]
    pub pinned_node: Option<NodeId>,
    pub priority: i32,
    /// None until bound. Invariant: Some exactly while the phase is placed.
    pub node_id: Option<NodeId>,
    pub phase: PodPhase,
    /// Monotonic placement counter: +1 on every bind and every revocation.
    /// Commands carrying an older incarnation are discarded.
    pub incarnation: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last time the owning agent reported status for this pod.
    pub last_reported_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
    pub restart_count: u32,
}

impl Pod {
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }
}
