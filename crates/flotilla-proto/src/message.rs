use std::collections::HashMap;

use chrono::{DateTime, Utc};
use flotilla_domain::{
    Node, NodeStatus, PodPhase, Resources, RuntimeKind, Taint, TerminationReason,
};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, WireError};

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One logical wire message: `{type, payload, correlationId?}`.
///
/// Replies echo the caller-supplied correlation id; unsolicited server
/// pushes carry a server-generated one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Envelope { message, correlation_id: None }
    }

    pub fn reply(message: Message, correlation_id: Option<String>) -> Self {
        Envelope { message, correlation_id }
    }
}

/// Result of parsing one raw frame. An unrecognised `type` is reported
/// separately so the session can answer it with `UNKNOWN_TYPE` instead of
/// dropping the connection.
#[derive(Debug)]
pub enum DecodedFrame {
    Message(Envelope),
    Unknown { ty: String, correlation_id: Option<String> },
}

/// Parse a raw frame body. Goes through a JSON value first so a missing or
/// unknown `type` is distinguishable from malformed payload fields.
pub fn parse_frame(bytes: &[u8]) -> Result<DecodedFrame, WireError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    let obj = value.as_object_mut().ok_or(WireError::MissingType)?;
    let ty = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(WireError::MissingType)?
        .to_string();
    let correlation_id = obj
        .get("correlationId")
        .and_then(|c| c.as_str())
        .map(String::from);
    if !Message::is_known_type(&ty) {
        return Ok(DecodedFrame::Unknown { ty, correlation_id });
    }
    // Messages without payload fields may omit the key entirely.
    if !obj.contains_key("payload") {
        obj.insert("payload".to_string(), serde_json::json!({}));
    }
    let envelope: Envelope = serde_json::from_value(value)?;
    Ok(DecodedFrame::Message(envelope))
}

// ── Message sum ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    #[serde(rename = "node:register")]
    NodeRegister(RegisterNode),
    #[serde(rename = "node:register:ack")]
    NodeRegisterAck(NodeRegisterAck),
    #[serde(rename = "node:register:error")]
    NodeRegisterError(ErrorBody),
    #[serde(rename = "node:heartbeat")]
    NodeHeartbeat(NodeHeartbeat),
    #[serde(rename = "node:heartbeat:ack")]
    NodeHeartbeatAck(HeartbeatAck),
    #[serde(rename = "pod:identify")]
    PodIdentify(PodIdentify),
    #[serde(rename = "pod:identify:ack")]
    PodIdentifyAck(PodRef),
    #[serde(rename = "pod:assign")]
    PodAssign(PodAssignment),
    #[serde(rename = "pod:assign:ack")]
    PodAssignAck(PodRef),
    #[serde(rename = "pod:terminate")]
    PodTerminate(PodTerminate),
    #[serde(rename = "pod:terminate:ack")]
    PodTerminateAck(PodRef),
    #[serde(rename = "pod:status")]
    PodStatus(PodStatusReport),
    #[serde(rename = "group:join")]
    GroupJoin(GroupChange),
    #[serde(rename = "group:join:ack")]
    GroupJoinAck(GroupChange),
    #[serde(rename = "group:leave")]
    GroupLeave(GroupChange),
    #[serde(rename = "group:leave:ack")]
    GroupLeaveAck(GroupChange),
    #[serde(rename = "group:leave-all")]
    GroupLeaveAll(GroupQuery),
    #[serde(rename = "group:leave-all:ack")]
    GroupLeaveAllAck(GroupQuery),
    #[serde(rename = "group:get-pods")]
    GroupGetPods(GroupChange),
    #[serde(rename = "group:get-pods:ack")]
    GroupGetPodsAck(GroupPodsAck),
    #[serde(rename = "group:get-groups")]
    GroupGetGroups(GroupQuery),
    #[serde(rename = "group:get-groups:ack")]
    GroupGetGroupsAck(GroupGroupsAck),
    #[serde(rename = "route:request")]
    RouteRequest(RouteRequest),
    #[serde(rename = "route:response")]
    RouteResponse(RouteResponse),
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl Message {
    pub fn is_known_type(ty: &str) -> bool {
        matches!(
            ty,
            "node:register"
                | "node:register:ack"
                | "node:register:error"
                | "node:heartbeat"
                | "node:heartbeat:ack"
                | "pod:identify"
                | "pod:identify:ack"
                | "pod:assign"
                | "pod:assign:ack"
                | "pod:terminate"
                | "pod:terminate:ack"
                | "pod:status"
                | "group:join"
                | "group:join:ack"
                | "group:leave"
                | "group:leave:ack"
                | "group:leave-all"
                | "group:leave-all:ack"
                | "group:get-pods"
                | "group:get-pods:ack"
                | "group:get-groups"
                | "group:get-groups:ack"
                | "route:request"
                | "route:response"
                | "error"
        )
    }
}

// ── Resource mirror ───────────────────────────────────────────────────────────

/// Wire shape of a resource vector. `maxPods` is the agent-facing name for
/// the pod-count dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub max_pods: u64,
    #[serde(default)]
    pub storage_bytes: u64,
}

impl From<ResourceSpec> for Resources {
    fn from(spec: ResourceSpec) -> Resources {
        Resources {
            cpu_millis: spec.cpu_millis,
            memory_bytes: spec.memory_bytes,
            pods: spec.max_pods,
            storage_bytes: spec.storage_bytes,
        }
    }
}

impl From<Resources> for ResourceSpec {
    fn from(r: Resources) -> ResourceSpec {
        ResourceSpec {
            cpu_millis: r.cpu_millis,
            memory_bytes: r.memory_bytes,
            max_pods: r.pods,
            storage_bytes: r.storage_bytes,
        }
    }
}

// ── Node messages ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityClaim {
    pub runtime_version: String,
    #[serde(default)]
    pub agent_build: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNode {
    pub name: String,
    pub runtime_type: RuntimeKind,
    pub capabilities: CapabilityClaim,
    pub allocatable: ResourceSpec,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Credential for the external auth provider, verified once at
    /// registration and never on the heartbeat path.
    #[serde(default)]
    pub token: Option<String>,
}

/// The registered-node view echoed back in `node:register:ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_id: String,
    pub name: String,
    pub runtime_type: RuntimeKind,
    pub status: NodeStatus,
    pub allocatable: ResourceSpec,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> NodeView {
        NodeView {
            node_id: node.id.to_string(),
            name: node.name.clone(),
            runtime_type: node.runtime,
            status: node.status,
            allocatable: node.allocatable.into(),
            labels: node.labels.clone(),
            registered_at: node.registered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterAck {
    pub node: NodeView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Agent's own view; informational, the lease engine is authoritative.
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub allocated: Option<ResourceSpec>,
    #[serde(default)]
    pub active_pods: Option<Vec<PodRef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub last_heartbeat: DateTime<Utc>,
}

// ── Pod messages ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIdentify {
    pub pod_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Pod identity echoed in acks and status-bearing lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub pod_id: String,
    pub incarnation: u64,
    #[serde(default)]
    pub status: Option<PodPhase>,
}

/// Everything the agent needs to fetch, start and account one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodAssignment {
    pub pod_id: String,
    pub incarnation: u64,
    pub pack_name: String,
    pub pack_version: String,
    pub bundle_ref: String,
    pub namespace: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub requests: ResourceSpec,
    pub limits: ResourceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTerminate {
    pub pod_id: String,
    pub incarnation: u64,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusReport {
    pub pod_id: String,
    pub incarnation: u64,
    pub status: PodPhase,
    #[serde(default)]
    pub reason: Option<TerminationReason>,
    #[serde(default)]
    pub restart_count: u32,
}

// ── Group & routing messages ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChange {
    pub pod_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupQuery {
    pub pod_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPodsAck {
    pub group_id: String,
    pub pods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupGroupsAck {
    pub pod_id: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub caller_service_id: String,
    pub target_service_id: String,
    #[serde(default)]
    pub non_sticky: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub allowed: bool,
    #[serde(default)]
    pub target_pod_id: Option<String>,
    #[serde(default)]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
