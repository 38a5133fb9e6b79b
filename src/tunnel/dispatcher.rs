//! Dispatcher: decodes accepted frames and routes them by command.
//!
//! `SubscribeFromPlugin` bodies are unwrapped layer by layer (JSON, base64,
//! protobuf envelope, command payload) and land in one of six per-command
//! queues. `PushToPluginAck` frames only report delivery failures.
//! Anything that fails to decode is logged and dropped; the connection stays up.

use std::sync::Arc;

use tracing::{debug, warn};

use super::connection::Shared;
use super::queue::{self, PushError, QueueReceiver, QueueSender};
use crate::config::{CommandQueuesConfig, QueueConfig};
use crate::error::BodyError;
use crate::observe::{names, Observer};
use crate::protocol::command::{
    EffectReportReq, PluginInfoReq, PullConfigListReq, PullReleaseReq, QueryAppMetadataReq,
    QueryHostProcAttrListReq,
};
use crate::protocol::{
    platform, AckBody, Agent, Cmd, Envelope, Frame, MessageType, Request, SubscribeFromPlugin,
};

/// One decoded plugin request waiting for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RecvTask<R> {
    /// Platform sequence id from the frame header.
    pub sequence_id: u64,
    /// Application sequence from the envelope, echoed in the response.
    pub seq: u64,
    pub agent: Agent,
    pub request: R,
}

/// Producer ends of the six command queues.
#[derive(Clone)]
pub(crate) struct CommandQueues {
    pub(crate) query_app_metadata: QueueSender<RecvTask<QueryAppMetadataReq>>,
    pub(crate) query_host_proc_attr_list: QueueSender<RecvTask<QueryHostProcAttrListReq>>,
    pub(crate) plugin_info: QueueSender<RecvTask<PluginInfoReq>>,
    pub(crate) effect_report: QueueSender<RecvTask<EffectReportReq>>,
    pub(crate) pull_release: QueueSender<RecvTask<PullReleaseReq>>,
    pub(crate) pull_config_list: QueueSender<RecvTask<PullConfigListReq>>,
}

/// Consumer ends, handed to the worker pools.
pub(crate) struct CommandReceivers {
    pub(crate) query_app_metadata: QueueReceiver<RecvTask<QueryAppMetadataReq>>,
    pub(crate) query_host_proc_attr_list: QueueReceiver<RecvTask<QueryHostProcAttrListReq>>,
    pub(crate) plugin_info: QueueReceiver<RecvTask<PluginInfoReq>>,
    pub(crate) effect_report: QueueReceiver<RecvTask<EffectReportReq>>,
    pub(crate) pull_release: QueueReceiver<RecvTask<PullReleaseReq>>,
    pub(crate) pull_config_list: QueueReceiver<RecvTask<PullConfigListReq>>,
}

fn command_queue<R>(
    endpoint: &str,
    cmd: Cmd,
    config: &CommandQueuesConfig,
    observer: &Arc<dyn Observer>,
) -> (QueueSender<RecvTask<R>>, QueueReceiver<RecvTask<R>>) {
    let queue_config = config.get(cmd).unwrap_or_else(QueueConfig::default);
    queue::bounded(endpoint, cmd.as_str(), queue_config, Arc::clone(observer))
}

/// Build the six command queues, each sized by its own config entry.
pub(crate) fn command_queues(
    endpoint: &str,
    config: &CommandQueuesConfig,
    observer: &Arc<dyn Observer>,
) -> (CommandQueues, CommandReceivers) {
    let (qam_tx, qam_rx) = command_queue(endpoint, Cmd::QueryAppMetadata, config, observer);
    let (qhp_tx, qhp_rx) = command_queue(endpoint, Cmd::QueryHostProcattrList, config, observer);
    let (pi_tx, pi_rx) = command_queue(endpoint, Cmd::PluginInfo, config, observer);
    let (er_tx, er_rx) = command_queue(endpoint, Cmd::EffectReport, config, observer);
    let (pr_tx, pr_rx) = command_queue(endpoint, Cmd::PullRelease, config, observer);
    let (pc_tx, pc_rx) = command_queue(endpoint, Cmd::PullConfiglist, config, observer);
    (
        CommandQueues {
            query_app_metadata: qam_tx,
            query_host_proc_attr_list: qhp_tx,
            plugin_info: pi_tx,
            effect_report: er_tx,
            pull_release: pr_tx,
            pull_config_list: pc_tx,
        },
        CommandReceivers {
            query_app_metadata: qam_rx,
            query_host_proc_attr_list: qhp_rx,
            plugin_info: pi_rx,
            effect_report: er_rx,
            pull_release: pr_rx,
            pull_config_list: pc_rx,
        },
    )
}

impl CommandQueues {
    /// Enqueue on the queue matching the request's command.
    pub(crate) async fn route(
        &self,
        sequence_id: u64,
        seq: u64,
        agent: Agent,
        request: Request,
    ) -> Result<(), PushError> {
        macro_rules! task {
            ($req:expr) => {
                RecvTask {
                    sequence_id,
                    seq,
                    agent,
                    request: $req,
                }
            };
        }
        match request {
            Request::QueryAppMetadata(r) => self.query_app_metadata.push(task!(r)).await,
            Request::QueryHostProcAttrList(r) => {
                self.query_host_proc_attr_list.push(task!(r)).await
            }
            Request::PluginInfo(r) => self.plugin_info.push(task!(r)).await,
            Request::EffectReport(r) => self.effect_report.push(task!(r)).await,
            Request::PullRelease(r) => self.pull_release.push(task!(r)).await,
            Request::PullConfigList(r) => self.pull_config_list.push(task!(r)).await,
        }
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Routed(Cmd),
    Fused(Cmd),
    Malformed,
    UnknownCommand(i32),
    PushAcked,
    PushRejected,
    Ignored,
}

fn decode_request(body: &[u8]) -> Result<(Agent, Envelope, Request), BodyError> {
    let subscribe: SubscribeFromPlugin = platform::decode(body)?;
    let envelope = Envelope::decode_bytes(&subscribe.message)?;
    let request = Request::decode(envelope.cmd, &envelope.data)?;
    Ok((subscribe.agent, envelope, request))
}

/// Decode and route one accepted frame.
pub(crate) async fn dispatch(
    endpoint: &str,
    frame: Frame,
    queues: &CommandQueues,
    observer: &dyn Observer,
) -> Outcome {
    let sequence_id = frame.header.sequence_id;
    match frame.header.message_type {
        MessageType::SubscribeFromPlugin => {
            let (agent, envelope, request) = match decode_request(&frame.body) {
                Ok(decoded) => decoded,
                Err(BodyError::UnknownCommand(cmd)) => {
                    debug!(endpoint, sequence_id, cmd, "Tunnel: dropping unhandled command");
                    observer.inc_counter(
                        names::FRAME_DROPPED,
                        &[("endpoint", endpoint), ("reason", "unknown_command")],
                    );
                    return Outcome::UnknownCommand(cmd);
                }
                Err(e) => {
                    warn!(endpoint, sequence_id, "Tunnel: malformed plugin request: {e}");
                    observer.inc_counter(
                        names::FRAME_DROPPED,
                        &[("endpoint", endpoint), ("reason", "malformed")],
                    );
                    return Outcome::Malformed;
                }
            };
            let cmd = request.cmd();
            debug!(
                endpoint,
                sequence_id,
                seq = envelope.seq,
                cmd = cmd.as_str(),
                agent = %agent,
                "Tunnel: plugin request"
            );
            match queues.route(sequence_id, envelope.seq, agent, request).await {
                Ok(()) => Outcome::Routed(cmd),
                // The queue already logged and counted the fuse.
                Err(_) => Outcome::Fused(cmd),
            }
        }
        MessageType::PushToPluginAck => match platform::decode::<AckBody>(&frame.body) {
            Ok(ack) if ack.is_ok() => Outcome::PushAcked,
            Ok(ack) => {
                warn!(
                    endpoint,
                    sequence_id,
                    err_code = ack.err_code,
                    "Tunnel: push rejected by platform: {}",
                    ack.err_msg
                );
                observer.inc_counter(
                    names::PUSH_FAILED,
                    &[("endpoint", endpoint), ("reason", "rejected")],
                );
                Outcome::PushRejected
            }
            Err(e) => {
                warn!(endpoint, sequence_id, "Tunnel: malformed push ack: {e}");
                observer.inc_counter(
                    names::FRAME_DROPPED,
                    &[("endpoint", endpoint), ("reason", "malformed")],
                );
                Outcome::Malformed
            }
        },
        other => {
            debug!(endpoint, message_type = other.as_str(), "Tunnel: ignoring frame");
            Outcome::Ignored
        }
    }
}

pub(crate) async fn run(shared: Arc<Shared>, recv: QueueReceiver<Frame>, queues: CommandQueues) {
    let endpoint = shared.endpoint.address.clone();
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            frame = recv.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        dispatch(&endpoint, frame, &queues, &*shared.observer).await;
    }
    debug!(endpoint = %endpoint, "Tunnel: dispatcher stopped");
}
