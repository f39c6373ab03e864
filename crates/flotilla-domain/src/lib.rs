pub mod error;
pub mod ids;
pub mod node;
pub mod pack;
pub mod placement;
pub mod pod;
pub mod resources;
pub mod version;
pub mod workload;

pub use error::DomainError;
pub use ids::{GroupId, NodeId, PackId, PodId, SessionId, WorkloadId};
pub use node::{
    Namespace, NamespacePhase, Node, NodeCapabilities, NodeOwner, NodeRegistration, NodeStatus,
};
pub use pack::{Pack, PackRuntime, PackVisibility};
pub use placement::{check_placement, FilterReason};
pub use pod::{
    Pod, PodPhase, PriorityClass, TerminationReason, UnschedulableReason,
};
pub use resources::{
    selector_matches, tolerated, Resources, RuntimeKind, Taint, TaintEffect, Toleration,
    TolerationOperator,
};
pub use version::{compare_versions, version_at_least};
pub use workload::{
    failure_backoff, CrashLoopState, ObservedReplicas, PodTemplate, Workload, WorkloadStatus,
};
