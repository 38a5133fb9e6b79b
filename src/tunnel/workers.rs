//! Command worker pools.
//!
//! One generic pool type serves all six commands: `command_workers` tasks per
//! command drain that command's queue, call the business handler and push
//! the response back to the originating agent through the send queue.
//!
//! A handler error answers the request with silence. `PluginInfo` also
//! syncs the session registry before its handler runs.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::Shared;
use super::dispatcher::{CommandReceivers, RecvTask};
use super::queue::QueueReceiver;
use super::writer::PushHandle;
use super::Services;
use crate::error::RegistryError;
use crate::handlers::{BusinessHandlers, HandlerFuture};
use crate::observe::{names, Observer};
use crate::protocol::command::{
    EffectReportReq, EffectReportResp, PluginInfoReq, PluginInfoResp, PullConfigListReq,
    PullConfigListResp, PullReleaseReq, PullReleaseResp, QueryAppMetadataReq,
    QueryAppMetadataResp, QueryHostProcAttrListReq, QueryHostProcAttrListResp,
};
use crate::protocol::{Agent, Cmd, Envelope};
use crate::registry::{PluginSession, SessionHooks, SessionRegistry};

/// Everything a worker needs besides its queue.
pub(crate) struct WorkerContext {
    handlers: Arc<dyn BusinessHandlers>,
    registry: Arc<dyn SessionRegistry>,
    observer: Arc<dyn Observer>,
    push: PushHandle,
    hooks: SessionHooks,
}

impl WorkerContext {
    pub(crate) fn new(services: &Services, push: PushHandle) -> Self {
        Self {
            hooks: services.handlers.session_hooks(),
            handlers: Arc::clone(&services.handlers),
            registry: Arc::clone(&services.registry),
            observer: Arc::clone(&services.observer),
            push,
        }
    }
}

/// Calls one business handler for one decoded request.
type Handler<R, P> = fn(&WorkerContext, u64, Agent, R) -> HandlerFuture<'_, P>;

/// Flush or delete every instance announced by a `PluginInfo` request.
///
/// A positive `timeout` (seconds) keeps the instance alive that long; zero
/// means the sidecar is going away.
pub(crate) fn sync_plugin_sessions(ctx: &WorkerContext, agent: &Agent, req: &PluginInfoReq) {
    for instance in &req.instances {
        let result = if instance.timeout > 0 {
            let session = PluginSession {
                instance_id: instance.instance_id.clone(),
                biz_id: instance.biz_id,
                app: instance.app.clone(),
                agent: agent.clone(),
            };
            let ttl = Duration::from_secs(u64::from(instance.timeout));
            ctx.registry
                .flush_session(session, ctx.push.clone(), &ctx.hooks, ttl)
        } else {
            ctx.registry.delete_session(&instance.instance_id)
        };
        match result {
            Ok(()) => {}
            Err(RegistryError::NotFound(id)) => {
                debug!(instance_id = %id, "Tunnel: plugin session already gone");
            }
            Err(e) => {
                warn!(
                    instance_id = %instance.instance_id,
                    agent = %agent,
                    "Tunnel: session registry update failed: {e}"
                );
            }
        }
    }
}

fn query_app_metadata(
    ctx: &WorkerContext,
    sequence_id: u64,
    agent: Agent,
    req: QueryAppMetadataReq,
) -> HandlerFuture<'_, QueryAppMetadataResp> {
    ctx.handlers.query_app_metadata(sequence_id, agent, req)
}

fn query_host_proc_attr_list(
    ctx: &WorkerContext,
    sequence_id: u64,
    agent: Agent,
    req: QueryHostProcAttrListReq,
) -> HandlerFuture<'_, QueryHostProcAttrListResp> {
    ctx.handlers.query_host_proc_attr_list(sequence_id, agent, req)
}

fn plugin_info(
    ctx: &WorkerContext,
    sequence_id: u64,
    agent: Agent,
    req: PluginInfoReq,
) -> HandlerFuture<'_, PluginInfoResp> {
    sync_plugin_sessions(ctx, &agent, &req);
    ctx.handlers.plugin_info(sequence_id, agent, req)
}

fn effect_report(
    ctx: &WorkerContext,
    sequence_id: u64,
    agent: Agent,
    req: EffectReportReq,
) -> HandlerFuture<'_, EffectReportResp> {
    ctx.handlers.effect_report(sequence_id, agent, req)
}

fn pull_release(
    ctx: &WorkerContext,
    sequence_id: u64,
    agent: Agent,
    req: PullReleaseReq,
) -> HandlerFuture<'_, PullReleaseResp> {
    ctx.handlers.pull_release(sequence_id, agent, req)
}

fn pull_config_list(
    ctx: &WorkerContext,
    sequence_id: u64,
    agent: Agent,
    req: PullConfigListReq,
) -> HandlerFuture<'_, PullConfigListResp> {
    ctx.handlers.pull_config_list(sequence_id, agent, req)
}

/// Spawn `command_workers` tasks serving one command queue.
fn spawn_pool<R, P>(
    cmd: Cmd,
    shared: &Arc<Shared>,
    ctx: &Arc<WorkerContext>,
    rx: QueueReceiver<RecvTask<R>>,
    handler: Handler<R, P>,
) -> Vec<JoinHandle<()>>
where
    R: Send + 'static,
    P: Message + 'static,
{
    (0..shared.endpoint.command_workers.max(1))
        .map(|id| {
            tokio::spawn(work_loop(
                cmd,
                id,
                Arc::clone(shared),
                Arc::clone(ctx),
                rx.clone(),
                handler,
            ))
        })
        .collect()
}

async fn work_loop<R, P>(
    cmd: Cmd,
    id: usize,
    shared: Arc<Shared>,
    ctx: Arc<WorkerContext>,
    rx: QueueReceiver<RecvTask<R>>,
    handler: Handler<R, P>,
) where
    R: Send + 'static,
    P: Message + 'static,
{
    let endpoint = shared.endpoint.address.clone();
    loop {
        let task = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            task = rx.pop() => match task {
                Some(task) => task,
                None => break,
            },
        };
        let RecvTask {
            sequence_id,
            seq,
            agent,
            request,
        } = task;

        let result = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            result = handler(&ctx, sequence_id, agent.clone(), request) => result,
        };
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    endpoint = %endpoint,
                    cmd = cmd.as_str(),
                    sequence_id,
                    agent = %agent,
                    "Tunnel: handler failed: {e}"
                );
                ctx.observer.inc_counter(
                    names::COMMAND,
                    &[("endpoint", endpoint.as_str()), ("cmd", cmd.as_str()), ("result", "error")],
                );
                continue;
            }
        };
        ctx.observer.inc_counter(
            names::COMMAND,
            &[("endpoint", endpoint.as_str()), ("cmd", cmd.as_str()), ("result", "ok")],
        );

        let envelope = Envelope::new(seq, cmd, &resp);
        if let Err(e) = ctx
            .push
            .push_to_plugin(sequence_id, vec![agent], &envelope)
            .await
        {
            debug!(
                endpoint = %endpoint,
                cmd = cmd.as_str(),
                sequence_id,
                "Tunnel: response dropped: {e:?}"
            );
        }
    }
    debug!(endpoint = %endpoint, cmd = cmd.as_str(), worker = id, "Tunnel: worker stopped");
}

/// Start all six command pools for one connection.
pub(crate) fn spawn_pools(
    shared: &Arc<Shared>,
    ctx: &Arc<WorkerContext>,
    rx: CommandReceivers,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    tasks.extend(spawn_pool(
        Cmd::QueryAppMetadata,
        shared,
        ctx,
        rx.query_app_metadata,
        query_app_metadata,
    ));
    tasks.extend(spawn_pool(
        Cmd::QueryHostProcattrList,
        shared,
        ctx,
        rx.query_host_proc_attr_list,
        query_host_proc_attr_list,
    ));
    tasks.extend(spawn_pool(Cmd::PluginInfo, shared, ctx, rx.plugin_info, plugin_info));
    tasks.extend(spawn_pool(
        Cmd::EffectReport,
        shared,
        ctx,
        rx.effect_report,
        effect_report,
    ));
    tasks.extend(spawn_pool(
        Cmd::PullRelease,
        shared,
        ctx,
        rx.pull_release,
        pull_release,
    ));
    tasks.extend(spawn_pool(
        Cmd::PullConfiglist,
        shared,
        ctx,
        rx.pull_config_list,
        pull_config_list,
    ));
    tasks
}
