//! Socket reader: the single consumer of the inbound stream.
//!
//! For every frame the reader checks that it belongs to the current session,
//! hands it to the recv queue and, for plugin requests, enqueues the
//! transport ack right away. It never waits on business logic: both
//! hand-offs are fused, so a stalled pipeline drops work instead of stopping
//! the socket.
//!
//! Any read error (I/O, bad header, end of stream) triggers a reconnect, and
//! so does a writer giving up on the socket. The loop exits only when the
//! connection is closed.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use super::connection::{Inbound, Shared};
use super::queue::QueueSender;
use super::writer::SendTask;
use crate::observe::names;
use crate::protocol::{Frame, Header, MessageType};

/// Why a frame was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reject {
    ServiceMismatch,
    SessionMismatch,
    UnexpectedType,
}

impl Reject {
    fn as_str(self) -> &'static str {
        match self {
            Self::ServiceMismatch => "service_mismatch",
            Self::SessionMismatch => "session_mismatch",
            Self::UnexpectedType => "unexpected_type",
        }
    }
}

/// Accept only frames for this service and session that the dispatcher handles.
pub(crate) fn validate(header: &Header, service_id: u32, session_id: u64) -> Result<(), Reject> {
    if header.service_id != service_id {
        return Err(Reject::ServiceMismatch);
    }
    if header.session_id != session_id {
        return Err(Reject::SessionMismatch);
    }
    match header.message_type {
        MessageType::SubscribeFromPlugin | MessageType::PushToPluginAck => Ok(()),
        _ => Err(Reject::UnexpectedType),
    }
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut inbound: Inbound,
    recv: QueueSender<Frame>,
    outbound: QueueSender<SendTask>,
) {
    let endpoint = shared.endpoint.address.clone();
    loop {
        let next = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            () = inbound.broken.cancelled() => {
                warn!(endpoint = %endpoint, "Tunnel: write side failed, dropping the socket");
                None
            }
            next = inbound.frames.next() => match next {
                Some(Ok(frame)) => Some(frame),
                Some(Err(e)) if e.is_header_error() => {
                    warn!(endpoint = %endpoint, "Tunnel: corrupt stream: {e}");
                    None
                }
                Some(Err(e)) => {
                    warn!(endpoint = %endpoint, "Tunnel: read failed: {e}");
                    None
                }
                None => {
                    warn!(endpoint = %endpoint, "Tunnel: platform closed the stream");
                    None
                }
            },
        };
        let Some(frame) = next else {
            // Release the dead socket before dialing again.
            drop(inbound);
            match shared.reconnect().await {
                Some(fresh) => {
                    inbound = fresh;
                    continue;
                }
                None => return,
            }
        };

        let header = frame.header;
        if let Err(reason) = validate(&header, shared.service_id(), shared.session_id()) {
            debug!(
                endpoint = %endpoint,
                message_type = header.message_type.as_str(),
                service_id = header.service_id,
                session_id = header.session_id,
                sequence_id = header.sequence_id,
                "Tunnel: dropping frame: {}",
                reason.as_str()
            );
            shared.observer.inc_counter(
                names::FRAME_DROPPED,
                &[("endpoint", endpoint.as_str()), ("reason", reason.as_str())],
            );
            continue;
        }

        // An ack promises the request reached the pipeline, so it follows
        // the recv push and is skipped when that push fails.
        if recv.push(frame).await.is_err() {
            continue;
        }
        if header.message_type == MessageType::SubscribeFromPlugin {
            let ack = SendTask::Ack {
                sequence_id: header.sequence_id,
            };
            if outbound.push(ack).await.is_err() {
                debug!(
                    endpoint = %endpoint,
                    sequence_id = header.sequence_id,
                    "Tunnel: ack dropped"
                );
            }
        }
    }
    debug!(endpoint = %endpoint, "Tunnel: reader stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use prost::Message;

    use super::*;
    use crate::protocol::command::{PullReleaseReq, PullReleaseResp, QueryAppMetadataReq};
    use crate::protocol::{platform, Agent, Cmd, Envelope, PushToPlugin};
    use crate::tunnel::testing::{
        endpoint, services, wait_for_state, RecordingHandlers, ScriptedDialer, SERVICE_ID,
    };
    use crate::tunnel::{ConnState, Connection};

    fn header(message_type: MessageType, service_id: u32, session_id: u64) -> Header {
        Header {
            message_type,
            service_id,
            session_id,
            sequence_id: 1,
        }
    }

    #[test]
    fn test_validate() {
        let ok = header(MessageType::SubscribeFromPlugin, 1001, 9);
        assert_eq!(validate(&ok, 1001, 9), Ok(()));
        let ack = header(MessageType::PushToPluginAck, 1001, 9);
        assert_eq!(validate(&ack, 1001, 9), Ok(()));

        let other_service = header(MessageType::SubscribeFromPlugin, 1002, 9);
        assert_eq!(validate(&other_service, 1001, 9), Err(Reject::ServiceMismatch));
        let stale = header(MessageType::SubscribeFromPlugin, 1001, 8);
        assert_eq!(validate(&stale, 1001, 9), Err(Reject::SessionMismatch));
        let register = header(MessageType::RegisterAck, 1001, 9);
        assert_eq!(validate(&register, 1001, 9), Err(Reject::UnexpectedType));
        let unknown = header(MessageType::Unknown(77), 1001, 9);
        assert_eq!(validate(&unknown, 1001, 9), Err(Reject::UnexpectedType));
    }

    fn pull_release(seq: u64) -> Envelope {
        Envelope::new(
            seq,
            Cmd::PullRelease,
            &PullReleaseReq {
                biz_id: 2,
                app_id: 9,
                uid: "u-1".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_request_is_acked_then_answered() {
        let dialer = ScriptedDialer::new();
        let mut platform = dialer.push_stream();
        let server = tokio::spawn(async move {
            platform.accept_register(9).await;
            platform
        });
        let handlers = RecordingHandlers::new();
        let (svc, obs, _) = services(Arc::clone(&handlers));
        let conn = Connection::init(endpoint(), dialer, svc).await.unwrap();
        let mut platform = server.await.unwrap();

        let agent = Agent::new("10.0.0.5", 1);
        platform.send_request(9, 42, &agent, &pull_release(42)).await;

        let ack = platform.recv().await;
        assert_eq!(ack.header.message_type, MessageType::SubscribeFromPluginAck);
        assert_eq!(ack.header.sequence_id, 42);
        assert_eq!(ack.header.session_id, 9);
        assert_eq!(ack.header.service_id, SERVICE_ID);

        let push = platform.recv().await;
        assert_eq!(push.header.message_type, MessageType::PushToPlugin);
        assert_eq!(push.header.sequence_id, 42);
        let body: PushToPlugin = platform::decode(&push.body).unwrap();
        assert_eq!(body.agents, vec![agent.clone()]);
        let envelope = Envelope::decode_bytes(&body.message).unwrap();
        assert_eq!(envelope.seq, 42);
        assert_eq!(envelope.cmd(), Cmd::PullRelease);
        assert_eq!(PullReleaseResp::decode(envelope.data.as_slice()).unwrap().release_id, 7);

        // Nothing else goes out for this request.
        assert!(platform.recv_within(Duration::from_millis(100)).await.is_none());
        assert_eq!(handlers.calls(), vec![(Cmd::PullRelease, 42, agent)]);
        assert_eq!(
            obs.counter(
                names::COMMAND,
                &[("endpoint", conn.endpoint()), ("cmd", "pull_release"), ("result", "ok")]
            ),
            1
        );
        conn.close().await;
    }

    #[tokio::test]
    async fn test_stale_session_frame_is_dropped() {
        let dialer = ScriptedDialer::new();
        let mut platform = dialer.push_stream();
        let server = tokio::spawn(async move {
            platform.accept_register(9).await;
            platform
        });
        let handlers = RecordingHandlers::new();
        let (svc, obs, _) = services(Arc::clone(&handlers));
        let conn = Connection::init(endpoint(), dialer, svc).await.unwrap();
        let mut platform = server.await.unwrap();

        let agent = Agent::new("10.0.0.5", 1);
        platform.send_request(8, 42, &agent, &pull_release(42)).await;

        assert!(platform.recv_within(Duration::from_millis(200)).await.is_none());
        assert!(handlers.calls().is_empty());
        assert_eq!(
            obs.counter(
                names::FRAME_DROPPED,
                &[("endpoint", conn.endpoint()), ("reason", "session_mismatch")]
            ),
            1
        );
        conn.close().await;
    }

    #[tokio::test]
    async fn test_ack_sent_even_when_handler_fails() {
        let dialer = ScriptedDialer::new();
        let mut platform = dialer.push_stream();
        let server = tokio::spawn(async move {
            platform.accept_register(9).await;
            platform
        });
        let handlers = RecordingHandlers::failing(&[Cmd::PullRelease]);
        let (svc, obs, _) = services(Arc::clone(&handlers));
        let conn = Connection::init(endpoint(), dialer, svc).await.unwrap();
        let mut platform = server.await.unwrap();

        let agent = Agent::new("10.0.0.5", 1);
        platform.send_request(9, 42, &agent, &pull_release(42)).await;

        let ack = platform.recv().await;
        assert_eq!(ack.header.message_type, MessageType::SubscribeFromPluginAck);
        assert!(platform.recv_within(Duration::from_millis(200)).await.is_none());
        assert_eq!(
            obs.counter(
                names::COMMAND,
                &[("endpoint", conn.endpoint()), ("cmd", "pull_release"), ("result", "error")]
            ),
            1
        );
        conn.close().await;
    }

    #[tokio::test]
    async fn test_full_command_queue_fuses_without_stalling_reader() {
        let mut ep = endpoint();
        ep.command_workers = 1;
        ep.queues.commands.pull_release.capacity = 1;
        ep.queues.commands.pull_release.timeout_ms = 20;

        let dialer = ScriptedDialer::new();
        let mut platform = dialer.push_stream();
        let server = tokio::spawn(async move {
            platform.accept_register(9).await;
            platform
        });
        let handlers = RecordingHandlers::blocked(&[Cmd::PullRelease]);
        let (svc, obs, _) = services(Arc::clone(&handlers));
        let conn = Connection::init(ep, dialer, svc).await.unwrap();
        let mut platform = server.await.unwrap();
        let agent = Agent::new("10.0.0.5", 1);

        // One request blocks the only worker, one fills the queue, the rest fuse.
        for seq in 1..=4 {
            platform.send_request(9, seq, &agent, &pull_release(seq)).await;
        }
        for seq in 1..=4 {
            let ack = platform.recv().await;
            assert_eq!(ack.header.message_type, MessageType::SubscribeFromPluginAck);
            assert_eq!(ack.header.sequence_id, seq);
        }

        // The reader keeps serving other commands.
        let metadata = Envelope::new(
            5,
            Cmd::QueryAppMetadata,
            &QueryAppMetadataReq {
                biz_id: 2,
                app: "demo".into(),
            },
        );
        platform.send_request(9, 5, &agent, &metadata).await;
        let ack = platform.recv().await;
        assert_eq!(ack.header.sequence_id, 5);
        let push = platform.recv().await;
        assert_eq!(push.header.message_type, MessageType::PushToPlugin);
        assert_eq!(push.header.sequence_id, 5);

        let mut state = conn.subscribe_state();
        wait_for_state(&mut state, ConnState::Streaming { session_id: 9 }).await;
        assert_eq!(
            obs.counter(
                names::QUEUE_FUSE,
                &[("endpoint", conn.endpoint()), ("queue", Cmd::PullRelease.as_str())]
            ),
            2
        );
        conn.close().await;
    }

    #[tokio::test]
    async fn test_corrupt_header_triggers_reconnect() {
        let dialer = ScriptedDialer::new();
        let mut first = dialer.push_stream();
        let mut second = dialer.push_stream();
        let first_server = tokio::spawn(async move {
            first.accept_register(1).await;
            first
        });
        let second_server = tokio::spawn(async move {
            let hello = second.accept_register(2).await;
            (hello, second)
        });

        let (svc, _, _) = services(RecordingHandlers::new());
        let conn = Connection::init(endpoint(), dialer, svc).await.unwrap();
        let mut first = first_server.await.unwrap();

        // No valid magic anywhere: the stream position is lost.
        first.send_raw(&[0u8; 64]).await;

        let mut state = conn.subscribe_state();
        wait_for_state(&mut state, ConnState::Streaming { session_id: 2 }).await;
        let (hello, _second) = second_server.await.unwrap();
        assert_eq!(hello.session_id, 1);
        assert!(first.closed_within(Duration::from_secs(2)).await);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_reader_exits_on_shutdown() {
        let dialer = ScriptedDialer::new();
        let mut platform = dialer.push_stream();
        let server = tokio::spawn(async move {
            platform.accept_register(1).await;
            platform
        });
        let (svc, _, _) = services(RecordingHandlers::new());
        let conn = Connection::init(endpoint(), dialer, svc).await.unwrap();
        let _platform = server.await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), conn.close())
            .await
            .expect("close did not finish");
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
