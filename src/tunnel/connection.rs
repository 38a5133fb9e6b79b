//! One persistent session to one GSE endpoint.
//!
//! States: `Disconnected → Registering → Streaming`, back to `Disconnected`
//! on any read failure, and `Closed` (sticky) on [`Connection::close`].
//!
//! ## Registration
//!
//! Dial, send `Register { service_id, session_id: 0 or stale }`, read exactly
//! one reply. Anything but a success `RegisterAck` fails the attempt. On
//! success the platform-assigned session id becomes authoritative for every
//! frame written until the next registration.
//!
//! ## Write guard
//!
//! The write half of the socket lives behind one `Mutex`. Adopting a new
//! socket and its session id happens under that lock, and writers stamp the
//! session id under it too, so a frame queued before a reconnect goes out
//! with the new session id.
//!
//! A write is bounded by `register_timeout` and by shutdown. A write that
//! fails or is abandoned halfway leaves the byte stream unusable, so the
//! writer drops the socket and trips its `broken` token; the reader watches
//! that token and reconnects.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::queue;
use super::writer::{PushHandle, SendTask};
use super::{dispatcher, reader, workers, writer, Services};
use crate::config::EndpointConfig;
use crate::error::TunnelError;
use crate::observe::{names, Observer};
use crate::protocol::{platform, AckBody, Frame, FrameCodec, Header, MessageType};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A connected, already-secured byte stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh transport to the endpoint. Called once per registration attempt.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self) -> BoxFuture<'_, io::Result<BoxedStream>>;
}

pub(crate) type FrameSink = FramedWrite<WriteHalf<BoxedStream>, FrameCodec>;
pub(crate) type FrameStream = FramedRead<ReadHalf<BoxedStream>, FrameCodec>;

/// Write half of the current socket.
struct WriteLink {
    sink: FrameSink,
    broken: CancellationToken,
}

/// Read half of a freshly registered socket, handed to the reader.
pub(crate) struct Inbound {
    pub(crate) frames: FrameStream,
    /// Cancelled when a writer gives up on this socket.
    pub(crate) broken: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Registering,
    Streaming { session_id: u64 },
    Closed,
}

/// State shared by the reader, dispatcher, writers and workers of one connection.
pub(crate) struct Shared {
    pub(crate) endpoint: EndpointConfig,
    dialer: Arc<dyn Dialer>,
    pub(crate) observer: Arc<dyn Observer>,
    /// Write guard. `None` before the first registration, after a failed
    /// write until the next one, and after close.
    link: Mutex<Option<WriteLink>>,
    /// Only changed while `link` is locked.
    session_id: AtomicU64,
    closed: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    state: watch::Sender<ConnState>,
}

impl Shared {
    pub(crate) fn new(
        endpoint: EndpointConfig,
        dialer: Arc<dyn Dialer>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let (state, _) = watch::channel(ConnState::Disconnected);
        Self {
            endpoint,
            dialer,
            observer,
            link: Mutex::new(None),
            session_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            state,
        }
    }

    pub(crate) fn service_id(&self) -> u32 {
        self.endpoint.service_id
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_state(&self, next: ConnState) {
        self.state.send_if_modified(|current| {
            if *current == ConnState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// One registration attempt, reported to the observer.
    pub(crate) async fn register(&self) -> Result<Inbound, TunnelError> {
        self.set_state(ConnState::Registering);
        let result = tokio::select! {
            () = self.shutdown.cancelled() => Err(TunnelError::Closed),
            r = self.try_register() => r,
        };
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.observer.inc_counter(
            names::REGISTER,
            &[("endpoint", self.endpoint.address.as_str()), ("result", outcome)],
        );
        if result.is_err() {
            self.set_state(ConnState::Disconnected);
        }
        result
    }

    async fn try_register(&self) -> Result<Inbound, TunnelError> {
        let timeout = self.endpoint.register_timeout;
        let stream = tokio::time::timeout(timeout, self.dialer.dial())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec);
        let mut sink = FramedWrite::new(write_half, FrameCodec);

        let hello = Header {
            message_type: MessageType::Register,
            service_id: self.service_id(),
            session_id: self.session_id(),
            sequence_id: 0,
        };
        sink.send(Frame::new(hello, Bytes::new())).await?;

        let reply = match tokio::time::timeout(timeout, frames.next()).await {
            Err(_) => return Err(TunnelError::RegisterTimeout(timeout)),
            Ok(None) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(Some(frame)) => frame?,
        };
        if reply.header.message_type != MessageType::RegisterAck {
            return Err(TunnelError::Register(format!(
                "expected register_ack, got {}",
                reply.header.message_type.as_str()
            )));
        }
        let ack: AckBody = platform::decode(&reply.body)
            .map_err(|e| TunnelError::Register(format!("bad ack body: {e}")))?;
        if !ack.is_ok() {
            return Err(TunnelError::Register(format!(
                "code {}: {}",
                ack.err_code, ack.err_msg
            )));
        }

        let broken = self.adopt(sink, reply.header.session_id).await?;
        Ok(Inbound { frames, broken })
    }

    /// Swap in a freshly registered socket and its session id. Returns the
    /// token a writer cancels when it gives up on this socket.
    pub(crate) async fn adopt(
        &self,
        sink: FrameSink,
        session_id: u64,
    ) -> Result<CancellationToken, TunnelError> {
        let mut guard = self.link.lock().await;
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        // At most one live socket: drop the old write half before adopting.
        if let Some(old) = guard.take() {
            old.broken.cancel();
        }
        let broken = CancellationToken::new();
        *guard = Some(WriteLink {
            sink,
            broken: broken.clone(),
        });
        self.session_id.store(session_id, Ordering::Release);
        drop(guard);
        self.set_state(ConnState::Streaming { session_id });
        Ok(broken)
    }

    /// Register again until it works or the connection is closed.
    ///
    /// There is no attempt limit: an unreachable relay cuts off every agent
    /// behind it, so the connection keeps trying at a fixed interval.
    pub(crate) async fn reconnect(&self) -> Option<Inbound> {
        let delay = self.endpoint.reconnect_delay;
        let mut attempt: u64 = 0;
        loop {
            if self.is_closed() {
                return None;
            }
            self.set_state(ConnState::Disconnected);
            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            match self.register().await {
                Ok(inbound) => {
                    info!(
                        endpoint = %self.endpoint.address,
                        session_id = self.session_id(),
                        attempt,
                        "Tunnel: reconnected"
                    );
                    return Some(inbound);
                }
                Err(TunnelError::Closed) => return None,
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint.address,
                        attempt,
                        "Tunnel: reconnect failed: {e}, retrying in {}ms",
                        delay.as_millis()
                    );
                }
            }
        }
    }

    /// Stamp the current session id and write one frame under the write guard.
    ///
    /// The guard is never held longer than `register_timeout`, and not at all
    /// once shutdown starts.
    pub(crate) async fn write(&self, mut frame: Frame) -> Result<(), TunnelError> {
        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(TunnelError::Closed);
        };
        frame.header.session_id = self.session_id();
        let limit = self.endpoint.register_timeout;
        let result = tokio::select! {
            () = self.shutdown.cancelled() => Err(TunnelError::Closed),
            sent = tokio::time::timeout(limit, link.sink.send(frame)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TunnelError::from(e)),
                Err(_) => Err(TunnelError::WriteTimeout(limit)),
            },
        };
        if result.is_err() {
            if let Some(dead) = guard.take() {
                dead.broken.cancel();
            }
        }
        result
    }
}

/// A registered connection and all tasks serving it.
pub struct Connection {
    shared: Arc<Shared>,
    push: PushHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Register once, then start the reader, dispatcher, writer pool and
    /// command pools. Fails if the first registration fails.
    pub async fn init(
        endpoint: EndpointConfig,
        dialer: Arc<dyn Dialer>,
        services: Services,
    ) -> Result<Self, TunnelError> {
        let shared = Arc::new(Shared::new(
            endpoint,
            dialer,
            Arc::clone(&services.observer),
        ));
        let inbound = shared.register().await?;
        info!(
            endpoint = %shared.endpoint.address,
            session_id = shared.session_id(),
            "Tunnel: registered"
        );

        let queues = &shared.endpoint.queues;
        let address = shared.endpoint.address.as_str();
        let (recv_tx, recv_rx) = queue::bounded::<Frame>(
            address,
            "recv",
            queues.recv,
            Arc::clone(&services.observer),
        );
        let (send_tx, send_rx) = queue::bounded::<SendTask>(
            address,
            "send",
            queues.send,
            Arc::clone(&services.observer),
        );
        let (command_tx, command_rx) =
            dispatcher::command_queues(address, &queues.commands, &services.observer);
        let push = PushHandle::new(send_tx.clone());

        let mut tasks = vec![
            tokio::spawn(reader::run(Arc::clone(&shared), inbound, recv_tx, send_tx)),
            tokio::spawn(dispatcher::run(Arc::clone(&shared), recv_rx, command_tx)),
        ];
        tasks.extend(writer::spawn_writers(&shared, send_rx));
        let ctx = Arc::new(workers::WorkerContext::new(&services, push.clone()));
        tasks.extend(workers::spawn_pools(&shared, &ctx, command_rx));

        Ok(Self {
            shared,
            push,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint.address
    }

    /// Session id from the latest successful registration.
    pub fn session_id(&self) -> u64 {
        self.shared.session_id()
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnState> {
        self.shared.state.subscribe()
    }

    /// Handle for pushing messages to plugins through this connection.
    pub fn push_handle(&self) -> PushHandle {
        self.push.clone()
    }

    /// Stop all loops and close the socket. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.cancel();
        // Writers give up the guard as soon as shutdown is cancelled.
        drop(self.shared.link.lock().await.take());
        self.shared.state.send_replace(ConnState::Closed);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let grace = self.shared.endpoint.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                endpoint = %self.shared.endpoint.address,
                "Tunnel: tasks still running after {}ms, detaching",
                grace.as_millis()
            );
        }
        info!(endpoint = %self.shared.endpoint.address, "Tunnel: connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
