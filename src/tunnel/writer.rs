//! Outbound queue and writer pool.
//!
//! Acks from the reader and responses/pushes from the workers all land in the
//! per-connection send queue. `writer_workers` tasks drain it, encode each
//! task into a frame and write it under the connection's write guard.

use std::sync::Arc;

use prost::Message;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::Shared;
use super::queue::{PushError, QueueReceiver, QueueSender};
use crate::error::{BodyError, TunnelError};
use crate::observe::names;
use crate::protocol::{
    platform, AckBody, Agent, Cmd, Envelope, Frame, Header, MessageType, PushToPlugin,
};

/// One unit of outbound work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTask {
    /// Transport-level acceptance of an inbound request.
    Ack { sequence_id: u64 },
    /// An application message for one or more agents.
    Push {
        sequence_id: u64,
        agents: Vec<Agent>,
        message: Vec<u8>,
    },
}

impl SendTask {
    pub fn sequence_id(&self) -> u64 {
        match self {
            Self::Ack { sequence_id } | Self::Push { sequence_id, .. } => *sequence_id,
        }
    }

    /// Encode into a frame. The session id is stamped at write time.
    pub fn into_frame(self, service_id: u32) -> Result<Frame, BodyError> {
        let (message_type, sequence_id, body) = match self {
            Self::Ack { sequence_id } => (
                MessageType::SubscribeFromPluginAck,
                sequence_id,
                platform::encode(&AckBody::ok())?,
            ),
            Self::Push {
                sequence_id,
                agents,
                message,
            } => (
                MessageType::PushToPlugin,
                sequence_id,
                platform::encode(&PushToPlugin { agents, message })?,
            ),
        };
        let header = Header {
            message_type,
            service_id,
            session_id: 0,
            sequence_id,
        };
        Ok(Frame::new(header, body))
    }
}

/// Cloneable handle that enqueues pushes on one connection.
///
/// Delivery is at-most-once: a push that fuses, or that the platform later
/// rejects, is logged and counted but never retried.
#[derive(Clone)]
pub struct PushHandle {
    outbound: QueueSender<SendTask>,
}

impl PushHandle {
    pub(crate) fn new(outbound: QueueSender<SendTask>) -> Self {
        Self { outbound }
    }

    /// Send an already-built envelope to `agents`.
    pub async fn push_to_plugin(
        &self,
        sequence_id: u64,
        agents: Vec<Agent>,
        envelope: &Envelope,
    ) -> Result<(), PushError> {
        self.outbound
            .push(SendTask::Push {
                sequence_id,
                agents,
                message: envelope.encode_to_vec(),
            })
            .await
    }

    /// Wrap `payload` as `cmd` and push it. Used for server-initiated
    /// notifications such as `NOTIFY_PUBLISH`.
    pub async fn notify(
        &self,
        sequence_id: u64,
        agents: Vec<Agent>,
        cmd: Cmd,
        payload: &impl Message,
    ) -> Result<(), PushError> {
        let envelope = Envelope::new(sequence_id, cmd, payload);
        self.push_to_plugin(sequence_id, agents, &envelope).await
    }
}

/// Spawn the writer pool for one connection.
pub(crate) fn spawn_writers(
    shared: &Arc<Shared>,
    outbound: QueueReceiver<SendTask>,
) -> Vec<JoinHandle<()>> {
    (0..shared.endpoint.writer_workers.max(1))
        .map(|id| tokio::spawn(write_loop(id, Arc::clone(shared), outbound.clone())))
        .collect()
}

async fn write_loop(id: usize, shared: Arc<Shared>, outbound: QueueReceiver<SendTask>) {
    let endpoint = shared.endpoint.address.clone();
    loop {
        let task = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            task = outbound.pop() => match task {
                Some(task) => task,
                None => break,
            },
        };
        shared.observer.observe_gauge(
            names::QUEUE_DEPTH,
            &[("endpoint", endpoint.as_str()), ("queue", outbound.name())],
            outbound.len() as f64,
        );

        let sequence_id = task.sequence_id();
        let frame = match task.into_frame(shared.service_id()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(endpoint = %endpoint, sequence_id, "Tunnel: encode outbound failed: {e}");
                shared.observer.inc_counter(
                    names::WRITE_FAILED,
                    &[("endpoint", endpoint.as_str()), ("reason", "encode")],
                );
                continue;
            }
        };
        // A failed write is not retried; the reader reconnects.
        let reason = match shared.write(frame).await {
            Ok(()) => continue,
            Err(TunnelError::Closed) if shared.shutdown.is_cancelled() => break,
            Err(e) => {
                warn!(endpoint = %endpoint, sequence_id, "Tunnel: write failed: {e}");
                if matches!(e, TunnelError::WriteTimeout(_)) {
                    "timeout"
                } else {
                    "io"
                }
            }
        };
        shared.observer.inc_counter(
            names::WRITE_FAILED,
            &[("endpoint", endpoint.as_str()), ("reason", reason)],
        );
    }
    debug!(endpoint = %endpoint, worker = id, "Tunnel: writer stopped");
}
