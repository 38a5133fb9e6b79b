//! In-memory platform and recording collaborators for tunnel tests.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, FramedWrite};

use super::connection::{BoxedStream, ConnState, Dialer, FrameSink};
use super::queue::{self, QueueReceiver};
use super::writer::{PushHandle, SendTask};
use super::Services;
use crate::config::{EndpointConfig, QueueConfig, QueuesConfig};
use crate::error::{HandlerError, RegistryError};
use crate::handlers::{BusinessHandlers, HandlerFuture};
use crate::observe::CounterObserver;
use crate::protocol::command::{
    EffectReportReq, EffectReportResp, PluginInfoReq, PluginInfoResp, PullConfigListReq,
    PullConfigListResp, PullReleaseReq, PullReleaseResp, QueryAppMetadataReq,
    QueryAppMetadataResp, QueryHostProcAttrListReq, QueryHostProcAttrListResp,
};
use crate::protocol::{
    platform, AckBody, Agent, Cmd, Envelope, Frame, FrameCodec, Header, MessageType,
    SubscribeFromPlugin,
};
use crate::registry::{PluginSession, SessionHooks, SessionRegistry};

pub(crate) const SERVICE_ID: u32 = 1001;
const WAIT: Duration = Duration::from_secs(5);

/// Small queues and delays so tests run fast. One writer keeps outbound order FIFO.
pub(crate) fn endpoint() -> EndpointConfig {
    let queue = QueueConfig {
        capacity: 64,
        timeout_ms: 50,
    };
    EndpointConfig {
        address: "gse-test:28668".into(),
        server_name: "gse-test".into(),
        service_id: SERVICE_ID,
        reconnect_delay: Duration::from_millis(10),
        register_timeout: Duration::from_millis(200),
        keepalive: None,
        read_buffer_size: 8192,
        write_buffer_size: 8192,
        writer_workers: 1,
        command_workers: 2,
        shutdown_grace: Duration::from_secs(1),
        queues: QueuesConfig {
            recv: queue,
            send: queue,
            commands: crate::config::CommandQueuesConfig {
                query_app_metadata: queue,
                query_host_procattr_list: queue,
                plugin_info: queue,
                effect_report: queue,
                pull_release: queue,
                pull_configlist: queue,
            },
        },
    }
}

/// Hands out pre-arranged transports in order; refuses once the script runs out.
pub(crate) struct ScriptedDialer {
    script: Mutex<VecDeque<io::Result<BoxedStream>>>,
}

impl ScriptedDialer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue a working transport and return the platform end of it.
    pub(crate) fn push_stream(&self) -> FakePlatform {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.script.lock().unwrap().push_back(Ok(Box::new(client)));
        FakePlatform::new(server)
    }

    pub(crate) fn push_failure(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
    }
}

impl Dialer for ScriptedDialer {
    fn dial(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        let next = self.script.lock().unwrap().pop_front();
        futures::future::ready(
            next.unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::ConnectionRefused))),
        )
        .boxed()
    }
}

/// The GSE side of an in-memory transport.
pub(crate) struct FakePlatform {
    framed: Framed<DuplexStream, FrameCodec>,
}

impl FakePlatform {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }

    /// A write half the connection can adopt directly, skipping registration.
    pub(crate) fn sink_pair() -> (FrameSink, Self) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let boxed: BoxedStream = Box::new(client);
        let (read_half, write_half) = tokio::io::split(boxed);
        // The read half is unused; dropping it does not close the stream.
        drop(read_half);
        (FramedWrite::new(write_half, FrameCodec), Self::new(server))
    }

    /// Read `Register`, answer with a success ack carrying `session_id`.
    pub(crate) async fn accept_register(&mut self, session_id: u64) -> Header {
        let hello = self.recv().await;
        assert_eq!(hello.header.message_type, MessageType::Register);
        let header = Header {
            message_type: MessageType::RegisterAck,
            service_id: hello.header.service_id,
            session_id,
            sequence_id: hello.header.sequence_id,
        };
        self.send(Frame::new(header, platform::encode(&AckBody::ok()).unwrap()))
            .await;
        hello.header
    }

    pub(crate) async fn reject_register(&mut self, code: i32, msg: &str) {
        let hello = self.recv().await;
        let header = Header {
            message_type: MessageType::RegisterAck,
            session_id: 0,
            ..hello.header
        };
        let ack = AckBody {
            err_code: code,
            err_msg: msg.to_string(),
        };
        self.send(Frame::new(header, platform::encode(&ack).unwrap()))
            .await;
    }

    pub(crate) async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Write bytes that bypass the codec.
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    pub(crate) async fn recv(&mut self) -> Frame {
        self.recv_within(WAIT)
            .await
            .expect("platform expected a frame")
    }

    pub(crate) async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(frame)) => Some(frame.unwrap()),
            Ok(None) | Err(_) => None,
        }
    }

    /// True if the engine closed its end of the stream within `wait`.
    pub(crate) async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Ok(None | Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => {}
                Err(_) => return false,
            }
        }
    }

    /// Send a plugin request wrapped in all protocol layers.
    pub(crate) async fn send_request(
        &mut self,
        session_id: u64,
        sequence_id: u64,
        agent: &Agent,
        envelope: &Envelope,
    ) {
        self.send(subscribe_frame(SERVICE_ID, session_id, sequence_id, agent, envelope))
            .await;
    }
}

pub(crate) fn subscribe_frame(
    service_id: u32,
    session_id: u64,
    sequence_id: u64,
    agent: &Agent,
    envelope: &Envelope,
) -> Frame {
    let body = SubscribeFromPlugin {
        agent: agent.clone(),
        message: envelope.encode_to_vec(),
    };
    Frame::new(
        Header {
            message_type: MessageType::SubscribeFromPlugin,
            service_id,
            session_id,
            sequence_id,
        },
        platform::encode(&body).unwrap(),
    )
}

pub(crate) async fn wait_for_state(rx: &mut watch::Receiver<ConnState>, want: ConnState) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

/// A push handle backed by a plain queue the test can inspect.
pub(crate) fn push_handle() -> (PushHandle, QueueReceiver<SendTask>) {
    let (tx, rx) = queue::bounded(
        "gse-test:28668",
        "send",
        QueueConfig {
            capacity: 64,
            timeout_ms: 50,
        },
        CounterObserver::new(),
    );
    (PushHandle::new(tx), rx)
}

/// Business handlers that record every call and answer fixed responses.
#[derive(Default)]
pub(crate) struct RecordingHandlers {
    pub(crate) calls: Mutex<Vec<(Cmd, u64, Agent)>>,
    failing: HashSet<Cmd>,
    blocked: HashSet<Cmd>,
}

impl RecordingHandlers {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handlers for `cmds` return an error.
    pub(crate) fn failing(cmds: &[Cmd]) -> Arc<Self> {
        Arc::new(Self {
            failing: cmds.iter().copied().collect(),
            ..Self::default()
        })
    }

    /// Handlers for `cmds` never complete.
    pub(crate) fn blocked(cmds: &[Cmd]) -> Arc<Self> {
        Arc::new(Self {
            blocked: cmds.iter().copied().collect(),
            ..Self::default()
        })
    }

    pub(crate) fn calls(&self) -> Vec<(Cmd, u64, Agent)> {
        self.calls.lock().unwrap().clone()
    }

    fn answer<T: Send + 'static>(
        &self,
        cmd: Cmd,
        sequence_id: u64,
        agent: Agent,
        resp: T,
    ) -> HandlerFuture<'static, T> {
        self.calls.lock().unwrap().push((cmd, sequence_id, agent));
        if self.blocked.contains(&cmd) {
            return futures::future::pending().boxed();
        }
        if self.failing.contains(&cmd) {
            return futures::future::ready(Err(HandlerError::new("backend unavailable"))).boxed();
        }
        futures::future::ready(Ok(resp)).boxed()
    }
}

impl BusinessHandlers for RecordingHandlers {
    fn query_app_metadata(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: QueryAppMetadataReq,
    ) -> HandlerFuture<'_, QueryAppMetadataResp> {
        let resp = QueryAppMetadataResp {
            app_id: 9,
            config_type: "file".into(),
            uid: req.app,
        };
        self.answer(Cmd::QueryAppMetadata, sequence_id, agent, resp)
    }

    fn query_host_proc_attr_list(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: QueryHostProcAttrListReq,
    ) -> HandlerFuture<'_, QueryHostProcAttrListResp> {
        self.answer(
            Cmd::QueryHostProcattrList,
            sequence_id,
            agent,
            QueryHostProcAttrListResp::default(),
        )
    }

    fn plugin_info(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: PluginInfoReq,
    ) -> HandlerFuture<'_, PluginInfoResp> {
        self.answer(Cmd::PluginInfo, sequence_id, agent, PluginInfoResp::default())
    }

    fn effect_report(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: EffectReportReq,
    ) -> HandlerFuture<'_, EffectReportResp> {
        self.answer(Cmd::EffectReport, sequence_id, agent, EffectReportResp::default())
    }

    fn pull_release(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: PullReleaseReq,
    ) -> HandlerFuture<'_, PullReleaseResp> {
        let resp = PullReleaseResp {
            release_id: 7,
            items: Vec::new(),
        };
        self.answer(Cmd::PullRelease, sequence_id, agent, resp)
    }

    fn pull_config_list(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: PullConfigListReq,
    ) -> HandlerFuture<'_, PullConfigListResp> {
        self.answer(
            Cmd::PullConfiglist,
            sequence_id,
            agent,
            PullConfigListResp::default(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegistryCall {
    Flush {
        instance_id: String,
        agent: Agent,
        ttl: Duration,
    },
    Delete(String),
}

/// Session registry that only records calls.
#[derive(Default)]
pub(crate) struct RecordingRegistry {
    calls: Mutex<Vec<RegistryCall>>,
}

impl RecordingRegistry {
    pub(crate) fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl SessionRegistry for RecordingRegistry {
    fn flush_session(
        &self,
        session: PluginSession,
        _push: PushHandle,
        _hooks: &SessionHooks,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.calls.lock().unwrap().push(RegistryCall::Flush {
            instance_id: session.instance_id,
            agent: session.agent,
            ttl,
        });
        Ok(())
    }

    fn delete_session(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(RegistryCall::Delete(instance_id.to_string()));
        Ok(())
    }

    fn session_count(&self) -> Result<usize, RegistryError> {
        Ok(self.calls.lock().unwrap().len())
    }
}

pub(crate) fn services(
    handlers: Arc<RecordingHandlers>,
) -> (Services, Arc<CounterObserver>, Arc<RecordingRegistry>) {
    let observer = CounterObserver::new();
    let registry = Arc::new(RecordingRegistry::default());
    let svc = Services {
        handlers,
        registry: registry.clone(),
        observer: observer.clone(),
    };
    (svc, observer, registry)
}
