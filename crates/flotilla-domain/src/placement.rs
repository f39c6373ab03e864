use crate::node::{Namespace, NamespacePhase, Node, NodeStatus};
use crate::pack::{Pack, PackVisibility};
use crate::pod::{Pod, UnschedulableReason};
use crate::resources::{selector_matches, tolerated};
use crate::version::version_at_least;

/// Why a node was rejected for a pod. Ordered from least to most specific:
/// when a whole pass fails, the most specific reason observed across all
/// candidates becomes the reported unschedulable category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    NodeNotOnline(NodeStatus),
    NodeUnschedulable,
    PinnedElsewhere,
    RuntimeMismatch,
    RuntimeVersionTooOld { required: String, actual: String },
    PolicyDenied,
    NamespaceTerminating,
    SelectorMismatch { key: String },
    TaintNotTolerated { key: String },
    InsufficientCapacity,
}

impl FilterReason {
    pub fn category(&self) -> UnschedulableReason {
        match self {
            FilterReason::NodeNotOnline(_) | FilterReason::NodeUnschedulable => {
                UnschedulableReason::NoNodes
            }
            FilterReason::PinnedElsewhere
            | FilterReason::RuntimeMismatch
            | FilterReason::RuntimeVersionTooOld { .. }
            | FilterReason::PolicyDenied
            | FilterReason::NamespaceTerminating => UnschedulableReason::NoCompatibleNodes,
            FilterReason::SelectorMismatch { .. } => UnschedulableReason::AffinityNotMet,
            FilterReason::TaintNotTolerated { .. } => UnschedulableReason::TaintNotTolerated,
            FilterReason::InsufficientCapacity => UnschedulableReason::InsufficientResources,
        }
    }

    /// Specificity rank for aggregating a failed pass into one category.
    pub fn rank(&self) -> u8 {
        match self {
            FilterReason::NodeNotOnline(_) | FilterReason::NodeUnschedulable => 0,
            FilterReason::PinnedElsewhere
            | FilterReason::RuntimeMismatch
            | FilterReason::RuntimeVersionTooOld { .. } => 1,
            FilterReason::PolicyDenied | FilterReason::NamespaceTerminating => 2,
            FilterReason::SelectorMismatch { .. } => 3,
            FilterReason::TaintNotTolerated { .. } => 4,
            FilterReason::InsufficientCapacity => 5,
        }
    }
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterReason::NodeNotOnline(status) => write!(f, "node is {}", status),
            FilterReason::NodeUnschedulable => write!(f, "node is cordoned"),
            FilterReason::PinnedElsewhere => write!(f, "pod is pinned to a different node"),
            FilterReason::RuntimeMismatch => write!(f, "pack runtime incompatible with node"),
            FilterReason::RuntimeVersionTooOld { required, actual } => {
                write!(f, "runtime {} older than required {}", actual, required)
            }
            FilterReason::PolicyDenied => write!(f, "pack owner may not run on this node"),
            FilterReason::NamespaceTerminating => write!(f, "namespace is terminating"),
            FilterReason::SelectorMismatch { key } => {
                write!(f, "node selector '{}' not satisfied", key)
            }
            FilterReason::TaintNotTolerated { key } => {
                write!(f, "taint '{}' not tolerated", key)
            }
            FilterReason::InsufficientCapacity => write!(f, "insufficient free capacity"),
        }
    }
}

/// The feasibility filter. Deterministic; used both for candidate selection
/// and for the re-verification inside the bind mutation.
pub fn check_placement(
    node: &Node,
    pod: &Pod,
    pack: &Pack,
    namespace: &Namespace,
) -> Result<(), FilterReason> {
    if node.status != NodeStatus::Online {
        return Err(FilterReason::NodeNotOnline(node.status));
    }
    if node.unschedulable {
        return Err(FilterReason::NodeUnschedulable);
    }
    if let Some(pinned) = &pod.pinned_node {
        if pinned != &node.id {
            return Err(FilterReason::PinnedElsewhere);
        }
    }
    if !pack.runtime.admits(node.runtime) {
        return Err(FilterReason::RuntimeMismatch);
    }
    if let Some(min) = &pack.min_runtime_version {
        if !version_at_least(&node.capabilities.runtime_version, min) {
            return Err(FilterReason::RuntimeVersionTooOld {
                required: min.clone(),
                actual: node.capabilities.runtime_version.clone(),
            });
        }
    }
    if namespace.phase == NamespacePhase::Terminating {
        return Err(FilterReason::NamespaceTerminating);
    }
    if pack.visibility == PackVisibility::Private
        && pack.owner_id != node.owner.user_id
        && !node.owner.admin
    {
        return Err(FilterReason::PolicyDenied);
    }
    if !selector_matches(&pod.node_selector, &node.labels) {
        let key = pod
            .node_selector
            .iter()
            .find(|&(k, v)| node.labels.get(k) != Some(v))
            .map(|(k, _)| k.clone())
            .unwrap_or_default();
        return Err(FilterReason::SelectorMismatch { key });
    }
    for taint in &node.taints {
        if taint.effect.is_hard() && !tolerated(taint, &pod.tolerations) {
            return Err(FilterReason::TaintNotTolerated { key: taint.key.clone() });
        }
    }
    if !node.remaining().covers(&pod.requests) {
        return Err(FilterReason::InsufficientCapacity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{NodeId, PackId, PodId};
    use crate::node::{NodeCapabilities, NodeOwner};
    use crate::pod::{PodPhase, PriorityClass};
    use crate::resources::{
        Resources, RuntimeKind, Taint, TaintEffect, Toleration, TolerationOperator,
    };
    use crate::pack::PackRuntime;
    use chrono::Utc;
    use std::collections::HashMap;

    fn node(id: &str) -> Node {
        Node {
            id: NodeId::new(id),
            name: id.to_string(),
            runtime: RuntimeKind::Server,
            capabilities: NodeCapabilities {
                runtime_version: "20.0.0".into(),
                agent_build: None,
            },
            allocatable: Resources { cpu_millis: 4000, memory_bytes: 8192, pods: 100, storage_bytes: 0 },
            allocated: Resources::ZERO,
            labels: HashMap::new(),
            taints: vec![],
            unschedulable: false,
            status: NodeStatus::Online,
            suspect_since: None,
            last_heartbeat: Utc::now(),
            session_id: None,
            owner: NodeOwner { user_id: "alice".into(), admin: false },
            registered_at: Utc::now(),
        }
    }

    fn pack(name: &str) -> Pack {
        Pack {
            id: PackId::new(format!("{name}-1.0.0")),
            name: name.to_string(),
            version: "1.0.0".into(),
            runtime: PackRuntime::ServerOnly,
            owner_id: "alice".into(),
            visibility: PackVisibility::Public,
            bundle_ref: format!("bundle://{name}/1.0.0"),
            description: None,
            min_runtime_version: None,
            metadata: HashMap::new(),
            registered_at: Utc::now(),
        }
    }

    fn pod(id: &str) -> Pod {
        Pod {
            id: PodId::new(id),
            workload_id: None,
            pack_name: "app".into(),
            pack_version: "1.0.0".into(),
            namespace: "default".into(),
            requests: Resources { cpu_millis: 500, memory_bytes: 512, pods: 1, storage_bytes: 0 },
            limits: Resources::ZERO,
            tolerations: vec![],
            node_selector: HashMap::new(),
            preferred_labels: HashMap::new(),
            pinned_node: None,
            priority: PriorityClass::Normal.priority(),
            node_id: None,
            phase: PodPhase::Pending,
            incarnation: 0,
            created_by: "test".into(),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            stopped_at: None,
            last_reported_at: None,
            termination_reason: None,
            restart_count: 0,
        }
    }

    fn ns() -> Namespace {
        Namespace::new("default")
    }

    #[test]
    fn online_fitting_node_passes() {
        assert!(check_placement(&node("n1"), &pod("p1"), &pack("app"), &ns()).is_ok());
    }

    #[test]
    fn suspect_node_is_rejected() {
        let mut n = node("n1");
        n.status = NodeStatus::Suspect;
        assert!(matches!(
            check_placement(&n, &pod("p1"), &pack("app"), &ns()),
            Err(FilterReason::NodeNotOnline(NodeStatus::Suspect))
        ));
    }

    #[test]
    fn server_only_pack_rejects_browser_node() {
        let mut n = node("n1");
        n.runtime = RuntimeKind::Browser;
        assert_eq!(
            check_placement(&n, &pod("p1"), &pack("app"), &ns()),
            Err(FilterReason::RuntimeMismatch)
        );
    }

    #[test]
    fn min_runtime_version_is_enforced() {
        let mut pk = pack("app");
        pk.min_runtime_version = Some("21.0.0".into());
        assert!(matches!(
            check_placement(&node("n1"), &pod("p1"), &pk, &ns()),
            Err(FilterReason::RuntimeVersionTooOld { .. })
        ));
    }

    #[test]
    fn untolerated_hard_taint_rejects() {
        let mut n = node("n1");
        n.taints.push(Taint {
            key: "dedicated".into(),
            value: Some("gpu".into()),
            effect: TaintEffect::NoSchedule,
        });
        assert_eq!(
            check_placement(&n, &pod("p1"), &pack("app"), &ns()),
            Err(FilterReason::TaintNotTolerated { key: "dedicated".into() })
        );

        let mut p = pod("p1");
        p.tolerations.push(Toleration {
            key: "dedicated".into(),
            operator: TolerationOperator::Equal,
            value: Some("gpu".into()),
            effect: Some(TaintEffect::NoSchedule),
        });
        assert!(check_placement(&n, &p, &pack("app"), &ns()).is_ok());
    }

    #[test]
    fn prefer_no_schedule_does_not_exclude() {
        let mut n = node("n1");
        n.taints.push(Taint {
            key: "spot".into(),
            value: None,
            effect: TaintEffect::PreferNoSchedule,
        });
        assert!(check_placement(&n, &pod("p1"), &pack("app"), &ns()).is_ok());
    }

    #[test]
    fn private_pack_needs_same_owner_or_admin_node() {
        let mut pk = pack("app");
        pk.visibility = PackVisibility::Private;
        pk.owner_id = "bob".into();
        assert_eq!(
            check_placement(&node("n1"), &pod("p1"), &pk, &ns()),
            Err(FilterReason::PolicyDenied)
        );

        let mut admin = node("n2");
        admin.owner.admin = true;
        assert!(check_placement(&admin, &pod("p1"), &pk, &ns()).is_ok());

        let mut same = node("n3");
        same.owner.user_id = "bob".into();
        assert!(check_placement(&same, &pod("p1"), &pk, &ns()).is_ok());
    }

    #[test]
    fn terminating_namespace_rejects() {
        let mut namespace = ns();
        namespace.phase = NamespacePhase::Terminating;
        assert_eq!(
            check_placement(&node("n1"), &pod("p1"), &pack("app"), &namespace),
            Err(FilterReason::NamespaceTerminating)
        );
    }

    #[test]
    fn full_node_rejects_on_capacity() {
        let mut n = node("n1");
        n.allocated = Resources { cpu_millis: 3800, memory_bytes: 512, pods: 1, storage_bytes: 0 };
        assert_eq!(
            check_placement(&n, &pod("p1"), &pack("app"), &ns()),
            Err(FilterReason::InsufficientCapacity)
        );
    }
}
