use chrono::{DateTime, Utc};
use flotilla_domain::{
    NodeId, PodId, PodPhase, TerminationReason, UnschedulableReason, WorkloadId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::metrics::StoreCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Node,
    Pod,
    Pack,
    Workload,
}

/// Structured transition event published on every store mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClusterEvent {
    NodeRegistered {
        id: Uuid,
        at: DateTime<Utc>,
        node_id: NodeId,
        name: String,
    },
    NodeDeregistered {
        id: Uuid,
        at: DateTime<Utc>,
        node_id: NodeId,
    },
    NodeSuspect {
        id: Uuid,
        at: DateTime<Utc>,
        node_id: NodeId,
    },
    NodeRecovered {
        id: Uuid,
        at: DateTime<Utc>,
        node_id: NodeId,
    },
    NodeLost {
        id: Uuid,
        at: DateTime<Utc>,
        node_id: NodeId,
        pods_revoked: usize,
    },
    PackRegistered {
        id: Uuid,
        at: DateTime<Utc>,
        pack_name: String,
        version: String,
    },
    PodCreated {
        id: Uuid,
        at: DateTime<Utc>,
        pod_id: PodId,
        workload_id: Option<WorkloadId>,
    },
    PodBound {
        id: Uuid,
        at: DateTime<Utc>,
        pod_id: PodId,
        node_id: NodeId,
        incarnation: u64,
    },
    PodPhaseChanged {
        id: Uuid,
        at: DateTime<Utc>,
        pod_id: PodId,
        incarnation: u64,
        from: PodPhase,
        to: PodPhase,
        reason: Option<TerminationReason>,
    },
    PodRevoked {
        id: Uuid,
        at: DateTime<Utc>,
        pod_id: PodId,
        node_id: Option<NodeId>,
        incarnation: u64,
        reason: TerminationReason,
    },
    PodUnschedulable {
        id: Uuid,
        at: DateTime<Utc>,
        pod_id: PodId,
        reason: UnschedulableReason,
    },
    WorkloadCreated {
        id: Uuid,
        at: DateTime<Utc>,
        workload_id: WorkloadId,
        name: String,
    },
    WorkloadDeleted {
        id: Uuid,
        at: DateTime<Utc>,
        workload_id: WorkloadId,
    },
    WorkloadStalled {
        id: Uuid,
        at: DateTime<Utc>,
        workload_id: WorkloadId,
        version: String,
        consecutive_failures: u32,
    },
}

impl ClusterEvent {
    pub fn severity(&self) -> EventSeverity {
        match self {
            ClusterEvent::NodeSuspect { .. } | ClusterEvent::PodUnschedulable { .. } => {
                EventSeverity::Warning
            }
            ClusterEvent::NodeLost { .. }
            | ClusterEvent::PodRevoked { .. }
            | ClusterEvent::WorkloadStalled { .. } => EventSeverity::Error,
            _ => EventSeverity::Info,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            ClusterEvent::NodeRegistered { .. }
            | ClusterEvent::NodeDeregistered { .. }
            | ClusterEvent::NodeSuspect { .. }
            | ClusterEvent::NodeRecovered { .. }
            | ClusterEvent::NodeLost { .. } => EventCategory::Node,
            ClusterEvent::PackRegistered { .. } => EventCategory::Pack,
            ClusterEvent::PodCreated { .. }
            | ClusterEvent::PodBound { .. }
            | ClusterEvent::PodPhaseChanged { .. }
            | ClusterEvent::PodRevoked { .. }
            | ClusterEvent::PodUnschedulable { .. } => EventCategory::Pod,
            ClusterEvent::WorkloadCreated { .. }
            | ClusterEvent::WorkloadDeleted { .. }
            | ClusterEvent::WorkloadStalled { .. } => EventCategory::Workload,
        }
    }

    pub fn resource_id(&self) -> String {
        match self {
            ClusterEvent::NodeRegistered { node_id, .. }
            | ClusterEvent::NodeDeregistered { node_id, .. }
            | ClusterEvent::NodeSuspect { node_id, .. }
            | ClusterEvent::NodeRecovered { node_id, .. }
            | ClusterEvent::NodeLost { node_id, .. } => node_id.to_string(),
            ClusterEvent::PackRegistered { pack_name, version, .. } => {
                format!("{}@{}", pack_name, version)
            }
            ClusterEvent::PodCreated { pod_id, .. }
            | ClusterEvent::PodBound { pod_id, .. }
            | ClusterEvent::PodPhaseChanged { pod_id, .. }
            | ClusterEvent::PodRevoked { pod_id, .. }
            | ClusterEvent::PodUnschedulable { pod_id, .. } => pod_id.to_string(),
            ClusterEvent::WorkloadCreated { workload_id, .. }
            | ClusterEvent::WorkloadDeleted { workload_id, .. }
            | ClusterEvent::WorkloadStalled { workload_id, .. } => workload_id.to_string(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ClusterEvent::NodeRegistered { at, .. }
            | ClusterEvent::NodeDeregistered { at, .. }
            | ClusterEvent::NodeSuspect { at, .. }
            | ClusterEvent::NodeRecovered { at, .. }
            | ClusterEvent::NodeLost { at, .. }
            | ClusterEvent::PackRegistered { at, .. }
            | ClusterEvent::PodCreated { at, .. }
            | ClusterEvent::PodBound { at, .. }
            | ClusterEvent::PodPhaseChanged { at, .. }
            | ClusterEvent::PodRevoked { at, .. }
            | ClusterEvent::PodUnschedulable { at, .. }
            | ClusterEvent::WorkloadCreated { at, .. }
            | ClusterEvent::WorkloadDeleted { at, .. }
            | ClusterEvent::WorkloadStalled { at, .. } => *at,
        }
    }

    /// Flatten into the envelope external sinks consume.
    pub fn record(&self) -> EventRecord {
        EventRecord {
            category: self.category(),
            severity: self.severity(),
            resource_id: self.resource_id(),
            message: format!("{:?}", self),
            timestamp: self.timestamp(),
        }
    }
}

/// The append-only envelope an external event sink receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub resource_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Subscriber handle over the store's broadcast channel.
///
/// A slow subscriber loses the oldest events rather than back-pressuring the
/// store; losses are added to the shared dropped-event counter.
pub struct EventStream {
    rx: broadcast::Receiver<ClusterEvent>,
    counters: Arc<StoreCounters>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<ClusterEvent>, counters: Arc<StoreCounters>) -> Self {
        EventStream { rx, counters }
    }

    /// Next event, skipping over any gap caused by lag. None when the store
    /// has been dropped.
    pub async fn next(&mut self) -> Option<ClusterEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.counters.add_events_dropped(n);
                    tracing::warn!(dropped = n, "event subscriber lagged; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
