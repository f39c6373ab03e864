use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flotilla_proto::{Envelope, FrameCodec};

use crate::dispatch::{handle_frame, new_session_id};
use crate::registry::SessionHandle;
use crate::session::{SessionContext, SessionState};

/// Accept loop: one [`run_connection`] task per agent connection.
pub async fn serve(
    listener: TcpListener,
    ctx: SessionContext,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "session listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("session listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    debug!(%peer, "agent connected");
                    run_connection(stream, ctx, cancel).await;
                    debug!(%peer, "agent disconnected");
                });
            }
        }
    }
}

/// Drive one duplex connection until it closes.
///
/// Three tasks cooperate: a reader feeding the bounded inbound queue (full
/// queue drops the frame with a log event), this handler consuming it in
/// arrival order, and a writer serializing outbound frames so a slow
/// consumer can never deadlock heartbeat handling.
pub async fn run_connection<S>(stream: S, ctx: SessionContext, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session_id = new_session_id();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut framed_read =
        FramedRead::new(read_half, FrameCodec::with_max_len(ctx.config.max_frame_len));
    let mut framed_write =
        FramedWrite::new(write_half, FrameCodec::with_max_len(ctx.config.max_frame_len));

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(ctx.config.outbound_queue);
    let (in_tx, mut in_rx) = mpsc::channel::<bytes::BytesMut>(ctx.config.inbound_queue);

    ctx.registry
        .insert(SessionHandle::new(session_id.clone(), out_tx.clone()))
        .await;

    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            if let Err(e) = framed_write.send(envelope).await {
                debug!(error = %e, "outbound write failed; closing writer");
                return;
            }
        }
    });

    let reader_session = session_id.clone();
    let reader_counters = ctx.store.counters();
    let reader = tokio::spawn(async move {
        while let Some(frame) = framed_read.next().await {
            match frame {
                Ok(bytes) => {
                    if in_tx.try_send(bytes).is_err() {
                        reader_counters.inc_frames_dropped();
                        warn!(session = %reader_session, "inbound queue full; frame dropped");
                    }
                }
                Err(e) => {
                    debug!(session = %reader_session, error = %e, "read failed; closing");
                    return;
                }
            }
        }
    });

    let mut state = SessionState::new(session_id.clone());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = in_rx.recv() => {
                let Some(bytes) = frame else { break };
                if let Some(reply) = handle_frame(&mut state, &bytes, &ctx).await {
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Disconnect: the lease engine owns the node's fate from here; we only
    // mark the session stale and flush what the session owned. The registry
    // entry holds an outbound sender, so it must go before the writer can
    // drain out.
    reader.abort();
    ctx.registry.remove(&session_id).await;
    drop(out_tx);
    let _ = writer.await;
    ctx.groups.flush_session(&session_id).await;
    if let Err(e) = ctx.store.clear_node_session(&session_id).await {
        warn!(session = %session_id, error = %e, "failed to clear node session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AnonymousVerifier;
    use crate::registry::SessionRegistry;
    use crate::session::SessionConfig;
    use bytes::BytesMut;
    use flotilla_proto::{
        parse_frame, CapabilityClaim, DecodedFrame, Message, NodeHeartbeat, RegisterNode,
        ResourceSpec,
    };
    use flotilla_router::{AllowAll, GroupRegistry, RouteArbiter, RouterConfig};
    use flotilla_store::{ClusterStore, MemoryBackend};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::codec::Encoder;

    fn test_ctx() -> (SessionContext, Arc<ClusterStore>) {
        let store = Arc::new(ClusterStore::new(Arc::new(MemoryBackend::new())));
        let arbiter = Arc::new(RouteArbiter::new(
            store.clone(),
            Arc::new(AllowAll),
            RouterConfig::default(),
        ));
        let ctx = SessionContext {
            store: store.clone(),
            arbiter,
            groups: Arc::new(GroupRegistry::new()),
            registry: Arc::new(SessionRegistry::new()),
            verifier: Arc::new(AnonymousVerifier),
            config: SessionConfig::default(),
        };
        (ctx, store)
    }

    fn encode(envelope: Envelope) -> Vec<u8> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();
        buf.to_vec()
    }

    fn register_frame(name: &str, correlation: &str) -> Vec<u8> {
        encode(Envelope::reply(
            Message::NodeRegister(RegisterNode {
                name: name.into(),
                runtime_type: flotilla_domain::RuntimeKind::Server,
                capabilities: CapabilityClaim {
                    runtime_version: "20.0.0".into(),
                    agent_build: None,
                },
                allocatable: ResourceSpec {
                    cpu_millis: 4000,
                    memory_bytes: 8192,
                    max_pods: 100,
                    storage_bytes: 0,
                },
                labels: HashMap::new(),
                taints: vec![],
                token: None,
            }),
            Some(correlation.to_string()),
        ))
    }

    async fn read_frame(client: &mut tokio::io::DuplexStream) -> Envelope {
        use tokio::io::AsyncReadExt;
        let mut len = [0u8; 4];
        client.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        client.read_exact(&mut body).await.unwrap();
        match parse_frame(&body).unwrap() {
            DecodedFrame::Message(envelope) => envelope,
            DecodedFrame::Unknown { ty, .. } => panic!("unexpected unknown frame {ty}"),
        }
    }

    #[tokio::test]
    async fn register_then_heartbeat_over_a_duplex_pipe() {
        use tokio::io::AsyncWriteExt;

        let (ctx, store) = test_ctx();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let conn = tokio::spawn(run_connection(server, ctx, cancel.clone()));

        client.write_all(&register_frame("edge-1", "c-1")).await.unwrap();
        let ack = read_frame(&mut client).await;
        assert_eq!(ack.correlation_id.as_deref(), Some("c-1"));
        let node_id = match ack.message {
            Message::NodeRegisterAck(ack) => ack.node.node_id,
            other => panic!("expected register ack, got {other:?}"),
        };
        assert!(store.node(&flotilla_domain::NodeId::new(&node_id)).await.is_some());

        let heartbeat = encode(Envelope::reply(
            Message::NodeHeartbeat(NodeHeartbeat {
                node_id: node_id.clone(),
                timestamp: chrono::Utc::now(),
                status: None,
                allocated: None,
                active_pods: None,
            }),
            Some("c-2".into()),
        ));
        client.write_all(&heartbeat).await.unwrap();
        let ack = read_frame(&mut client).await;
        assert!(matches!(ack.message, Message::NodeHeartbeatAck(_)));

        // Closing the client ends the connection and clears the session.
        drop(client);
        conn.await.unwrap();
        let node = store.node(&flotilla_domain::NodeId::new(&node_id)).await.unwrap();
        assert!(node.session_id.is_none(), "disconnect must mark the session stale");
    }

    #[tokio::test]
    async fn first_frame_must_be_an_identity_claim() {
        use tokio::io::AsyncWriteExt;

        let (ctx, _store) = test_ctx();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(server, ctx, cancel));

        let heartbeat = encode(Envelope::reply(
            Message::NodeHeartbeat(NodeHeartbeat {
                node_id: "nope".into(),
                timestamp: chrono::Utc::now(),
                status: None,
                allocated: None,
                active_pods: None,
            }),
            Some("c-1".into()),
        ));
        client.write_all(&heartbeat).await.unwrap();
        let reply = read_frame(&mut client).await;
        match reply.message {
            Message::Error(body) => {
                assert_eq!(body.code, flotilla_proto::ErrorCode::NotRegistered)
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_gets_unknown_type_error() {
        use tokio::io::AsyncWriteExt;

        let (ctx, _store) = test_ctx();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_connection(server, ctx, CancellationToken::new()));

        let raw = br#"{"type":"node:mystery","payload":{},"correlationId":"c-9"}"#;
        let mut frame = Vec::new();
        frame.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        frame.extend_from_slice(raw);
        client.write_all(&frame).await.unwrap();

        let reply = read_frame(&mut client).await;
        assert_eq!(reply.correlation_id.as_deref(), Some("c-9"));
        match reply.message {
            Message::Error(body) => {
                assert_eq!(body.code, flotilla_proto::ErrorCode::UnknownType)
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_for_foreign_node_is_forbidden() {
        use tokio::io::AsyncWriteExt;

        let (ctx, store) = test_ctx();
        // A node registered through a different session.
        let foreign = store
            .register_node(
                flotilla_domain::NodeRegistration {
                    name: "other".into(),
                    runtime: flotilla_domain::RuntimeKind::Server,
                    capabilities: Default::default(),
                    allocatable: flotilla_domain::Resources {
                        cpu_millis: 1000,
                        memory_bytes: 1024,
                        pods: 10,
                        storage_bytes: 0,
                    },
                    labels: Default::default(),
                    taints: vec![],
                    owner: flotilla_domain::NodeOwner { user_id: "bob".into(), admin: false },
                },
                flotilla_domain::SessionId::new("someone-else"),
                chrono::Utc::now(),
            )
            .await
            .unwrap();

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_connection(server, ctx, CancellationToken::new()));

        client.write_all(&register_frame("mine", "c-1")).await.unwrap();
        read_frame(&mut client).await;

        let heartbeat = encode(Envelope::reply(
            Message::NodeHeartbeat(NodeHeartbeat {
                node_id: foreign.id.to_string(),
                timestamp: chrono::Utc::now(),
                status: None,
                allocated: None,
                active_pods: None,
            }),
            Some("c-2".into()),
        ));
        client.write_all(&heartbeat).await.unwrap();
        let reply = read_frame(&mut client).await;
        match reply.message {
            Message::Error(body) => assert_eq!(body.code, flotilla_proto::ErrorCode::Forbidden),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }
}
