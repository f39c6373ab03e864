use std::collections::HashSet;

use chrono::Utc;
use flotilla_domain::{NodeId, NodeOwner, NodeRegistration, PodId, SessionId};
use flotilla_proto::{
    parse_frame, DecodedFrame, Envelope, ErrorBody, ErrorCode, GroupGroupsAck, GroupPodsAck,
    HeartbeatAck, Message, NodeRegisterAck, NodeView, PodRef, RouteResponse,
};
use flotilla_store::StoreError;
use tracing::{debug, warn};

use crate::auth::PrincipalKind;
use crate::error::error_code_for;
use crate::session::{Identity, SessionContext, SessionState};

fn error_reply(code: ErrorCode, message: impl Into<String>, correlation: Option<String>) -> Envelope {
    Envelope::reply(
        Message::Error(ErrorBody { code, message: message.into() }),
        correlation,
    )
}

/// Decode one raw frame and run it through the dispatcher. Unknown types
/// are answered with `UNKNOWN_TYPE`; malformed frames with `VALIDATION`.
pub(crate) async fn handle_frame(
    state: &mut SessionState,
    bytes: &[u8],
    ctx: &SessionContext,
) -> Option<Envelope> {
    match parse_frame(bytes) {
        Ok(DecodedFrame::Message(envelope)) => dispatch(state, envelope, ctx).await,
        Ok(DecodedFrame::Unknown { ty, correlation_id }) => {
            debug!(session = %state.id, ty = %ty, "unknown message type");
            Some(error_reply(
                ErrorCode::UnknownType,
                format!("unknown message type '{}'", ty),
                correlation_id,
            ))
        }
        Err(e) => {
            warn!(session = %state.id, error = %e, "malformed frame");
            Some(error_reply(ErrorCode::Validation, e.to_string(), None))
        }
    }
}

/// The central dispatcher over the closed message sum.
pub(crate) async fn dispatch(
    state: &mut SessionState,
    envelope: Envelope,
    ctx: &SessionContext,
) -> Option<Envelope> {
    let correlation = envelope.correlation_id;
    match envelope.message {
        Message::NodeRegister(register) => {
            Some(handle_register(state, register, ctx, correlation).await)
        }
        Message::PodIdentify(identify) => {
            Some(handle_identify(state, identify, ctx, correlation).await)
        }

        // Everything else requires a bound identity first.
        _ if state.identity.is_none() => {
            debug!(session = %state.id, "frame before identity claim");
            Some(error_reply(
                ErrorCode::NotRegistered,
                "session has no identity; send node:register or pod:identify first",
                correlation,
            ))
        }

        Message::NodeHeartbeat(heartbeat) => {
            Some(handle_heartbeat(state, heartbeat, ctx, correlation).await)
        }
        Message::PodStatus(report) => {
            handle_pod_status(state, report, ctx).await;
            None
        }
        Message::PodAssignAck(ack) => {
            debug!(session = %state.id, pod_id = %ack.pod_id, incarnation = ack.incarnation,
                   "assignment acknowledged");
            None
        }
        Message::PodTerminateAck(ack) => {
            debug!(session = %state.id, pod_id = %ack.pod_id, incarnation = ack.incarnation,
                   "termination acknowledged");
            None
        }

        Message::GroupJoin(change) => {
            let pod_id = match own_pod(state, &change.pod_id, &correlation) {
                Ok(p) => p,
                Err(e) => return Some(e),
            };
            ctx.groups
                .join(&state.id, &pod_id, &flotilla_domain::GroupId::new(&change.group_id))
                .await;
            Some(Envelope::reply(Message::GroupJoinAck(change), correlation))
        }
        Message::GroupLeave(change) => {
            let pod_id = match own_pod(state, &change.pod_id, &correlation) {
                Ok(p) => p,
                Err(e) => return Some(e),
            };
            ctx.groups
                .leave(&state.id, &pod_id, &flotilla_domain::GroupId::new(&change.group_id))
                .await;
            Some(Envelope::reply(Message::GroupLeaveAck(change), correlation))
        }
        Message::GroupLeaveAll(query) => {
            let pod_id = match own_pod(state, &query.pod_id, &correlation) {
                Ok(p) => p,
                Err(e) => return Some(e),
            };
            ctx.groups.leave_all(&state.id, &pod_id).await;
            Some(Envelope::reply(Message::GroupLeaveAllAck(query), correlation))
        }
        Message::GroupGetPods(change) => {
            if let Err(e) = own_pod(state, &change.pod_id, &correlation) {
                return Some(e);
            }
            let pods = ctx
                .groups
                .pods_in(&flotilla_domain::GroupId::new(&change.group_id))
                .await
                .into_iter()
                .map(|p| p.0)
                .collect();
            Some(Envelope::reply(
                Message::GroupGetPodsAck(GroupPodsAck { group_id: change.group_id, pods }),
                correlation,
            ))
        }
        Message::GroupGetGroups(query) => {
            let pod_id = match own_pod(state, &query.pod_id, &correlation) {
                Ok(p) => p,
                Err(e) => return Some(e),
            };
            let groups = ctx
                .groups
                .groups_of(&pod_id)
                .await
                .into_iter()
                .map(|g| g.0)
                .collect();
            Some(Envelope::reply(
                Message::GroupGetGroupsAck(GroupGroupsAck { pod_id: query.pod_id, groups }),
                correlation,
            ))
        }

        Message::RouteRequest(request) => {
            if state.pod_claim().is_none() {
                return Some(error_reply(
                    ErrorCode::Forbidden,
                    "route:request is only valid on pod sessions",
                    correlation,
                ));
            }
            let decision = ctx
                .arbiter
                .route(&request.caller_service_id, &request.target_service_id)
                .await;
            let response = match decision.target {
                Some((pod_id, node_id)) => RouteResponse {
                    allowed: true,
                    target_pod_id: Some(pod_id.0),
                    target_node_id: Some(node_id.0),
                    reason: None,
                },
                None => RouteResponse {
                    allowed: false,
                    target_pod_id: None,
                    target_node_id: None,
                    reason: decision.denial.map(|d| d.to_string()),
                },
            };
            Some(Envelope::reply(Message::RouteResponse(response), correlation))
        }

        Message::Error(body) => {
            warn!(session = %state.id, code = %body.code, message = %body.message,
                  "peer reported an error");
            None
        }

        // Server-originated types have no business arriving inbound.
        _ => {
            debug!(session = %state.id, "server-originated type received from peer");
            Some(error_reply(
                ErrorCode::Validation,
                "message type is server-originated",
                correlation,
            ))
        }
    }
}

/// A pod session may only operate on its own pod id.
fn own_pod(
    state: &SessionState,
    claimed: &str,
    correlation: &Option<String>,
) -> Result<PodId, Envelope> {
    match state.pod_claim() {
        Some(pod_id) if pod_id.as_str() == claimed => Ok(pod_id.clone()),
        Some(_) => Err(error_reply(
            ErrorCode::Forbidden,
            format!("session does not own pod {}", claimed),
            correlation.clone(),
        )),
        None => Err(error_reply(
            ErrorCode::Forbidden,
            "group and route messages are only valid on pod sessions",
            correlation.clone(),
        )),
    }
}

async fn handle_register(
    state: &mut SessionState,
    register: flotilla_proto::RegisterNode,
    ctx: &SessionContext,
    correlation: Option<String>,
) -> Envelope {
    if state.pod_claim().is_some() {
        return Envelope::reply(
            Message::NodeRegisterError(ErrorBody {
                code: ErrorCode::Forbidden,
                message: "pod sessions cannot register nodes".into(),
            }),
            correlation,
        );
    }

    let principal = match ctx
        .verifier
        .verify(register.token.as_deref(), PrincipalKind::Agent)
        .await
    {
        Ok(p) => p,
        Err(reason) => {
            warn!(session = %state.id, reason = %reason, "node registration rejected by auth");
            return Envelope::reply(
                Message::NodeRegisterError(ErrorBody {
                    code: ErrorCode::Forbidden,
                    message: reason,
                }),
                correlation,
            );
        }
    };

    // Additional nodes over the same session must belong to the same
    // principal as the first.
    if let Some(Identity::Agent { principal: existing, .. }) = &state.identity {
        if existing.id != principal.id {
            return Envelope::reply(
                Message::NodeRegisterError(ErrorBody {
                    code: ErrorCode::Forbidden,
                    message: "session is bound to a different principal".into(),
                }),
                correlation,
            );
        }
    }

    let registration = NodeRegistration {
        name: register.name,
        runtime: register.runtime_type,
        capabilities: flotilla_domain::NodeCapabilities {
            runtime_version: register.capabilities.runtime_version,
            agent_build: register.capabilities.agent_build,
        },
        allocatable: register.allocatable.into(),
        labels: register.labels,
        taints: register.taints,
        owner: NodeOwner { user_id: principal.id.clone(), admin: principal.admin },
    };

    match ctx
        .store
        .register_node(registration, state.id.clone(), Utc::now())
        .await
    {
        Ok(node) => {
            ctx.registry.bind_node(node.id.clone(), state.id.clone()).await;
            match &mut state.identity {
                Some(Identity::Agent { nodes, .. }) => {
                    nodes.insert(node.id.clone());
                }
                _ => {
                    let mut nodes = HashSet::new();
                    nodes.insert(node.id.clone());
                    state.identity = Some(Identity::Agent { principal, nodes });
                }
            }
            Envelope::reply(
                Message::NodeRegisterAck(NodeRegisterAck { node: NodeView::from(&node) }),
                correlation,
            )
        }
        Err(e) => Envelope::reply(
            Message::NodeRegisterError(ErrorBody {
                code: error_code_for(&e),
                message: e.to_string(),
            }),
            correlation,
        ),
    }
}

async fn handle_identify(
    state: &mut SessionState,
    identify: flotilla_proto::PodIdentify,
    ctx: &SessionContext,
    correlation: Option<String>,
) -> Envelope {
    if state.identity.is_some() {
        return error_reply(
            ErrorCode::Conflict,
            "session already has an identity",
            correlation,
        );
    }
    if let Err(reason) = ctx
        .verifier
        .verify(identify.token.as_deref(), PrincipalKind::PodRuntime)
        .await
    {
        warn!(session = %state.id, reason = %reason, "pod identity rejected by auth");
        return error_reply(ErrorCode::Forbidden, reason, correlation);
    }

    let pod_id = PodId::new(&identify.pod_id);
    let Some(pod) = ctx.store.pod(&pod_id).await else {
        return error_reply(
            ErrorCode::NotFound,
            format!("pod {} is not known", identify.pod_id),
            correlation,
        );
    };

    state.identity = Some(Identity::Pod { pod_id: pod_id.clone() });
    Envelope::reply(
        Message::PodIdentifyAck(PodRef {
            pod_id: pod.id.0,
            incarnation: pod.incarnation,
            status: Some(pod.phase),
        }),
        correlation,
    )
}

async fn handle_heartbeat(
    state: &mut SessionState,
    heartbeat: flotilla_proto::NodeHeartbeat,
    ctx: &SessionContext,
    correlation: Option<String>,
) -> Envelope {
    let node_id = NodeId::new(&heartbeat.node_id);
    if !state.owns_node(&node_id) {
        return error_reply(
            ErrorCode::Forbidden,
            format!("node {} did not register through this session", node_id),
            correlation,
        );
    }

    let outcome = tokio::time::timeout(
        ctx.config.heartbeat_deadline,
        ctx.store.heartbeat(&node_id, heartbeat.timestamp),
    )
    .await;
    let report = match outcome {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            return error_reply(error_code_for(&e), e.to_string(), correlation);
        }
        Err(_) => {
            warn!(session = %state.id, node_id = %node_id, "heartbeat deadline exceeded");
            return error_reply(ErrorCode::Unavailable, "heartbeat deadline exceeded", correlation);
        }
    };

    // Piggybacked pod statuses ride the same frame.
    if let Some(active) = heartbeat.active_pods {
        for entry in active {
            if let Some(status) = entry.status {
                let pod_id = PodId::new(&entry.pod_id);
                if let Err(e) = ctx
                    .store
                    .record_pod_status(&pod_id, entry.incarnation, status, None, 0, Utc::now())
                    .await
                {
                    debug!(pod_id = %pod_id, error = %e, "piggybacked status ignored");
                }
            }
        }
    }

    Envelope::reply(
        Message::NodeHeartbeatAck(HeartbeatAck { last_heartbeat: report.node.last_heartbeat }),
        correlation,
    )
}

async fn handle_pod_status(
    state: &SessionState,
    report: flotilla_proto::PodStatusReport,
    ctx: &SessionContext,
) {
    let pod_id = PodId::new(&report.pod_id);
    let owns = match ctx.store.pod(&pod_id).await.and_then(|p| p.node_id) {
        Some(node_id) => state.owns_node(&node_id),
        None => false,
    };
    if !owns {
        warn!(session = %state.id, pod_id = %pod_id,
              "status report for a pod this session does not host");
        return;
    }

    match ctx
        .store
        .record_pod_status(
            &pod_id,
            report.incarnation,
            report.status,
            report.reason,
            report.restart_count,
            Utc::now(),
        )
        .await
    {
        Ok(_) => {}
        Err(StoreError::StaleIncarnation { current, got, .. }) => {
            debug!(pod_id = %pod_id, current, got, "stale status report discarded");
        }
        Err(e) => {
            warn!(pod_id = %pod_id, error = %e, "status report rejected");
        }
    }
}

pub(crate) fn new_session_id() -> SessionId {
    SessionId::new(uuid::Uuid::new_v4().to_string())
}
