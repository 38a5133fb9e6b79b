//! Business-handler port.
//!
//! One method per application command, `(sequence_id, agent, request) ->
//! response`. The engine owns decoding, queueing and re-encoding; the
//! implementation only answers. An `Err` means the request is answered with
//! silence.

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::error::HandlerError;
use crate::protocol::command::{
    EffectReportReq, EffectReportResp, PluginInfoReq, PluginInfoResp, PullConfigListReq,
    PullConfigListResp, PullReleaseReq, PullReleaseResp, QueryAppMetadataReq,
    QueryAppMetadataResp, QueryHostProcAttrListReq, QueryHostProcAttrListResp,
};
use crate::protocol::Agent;
use crate::registry::SessionHooks;

pub type HandlerFuture<'a, T> = BoxFuture<'a, Result<T, HandlerError>>;

pub trait BusinessHandlers: Send + Sync + 'static {
    fn query_app_metadata(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: QueryAppMetadataReq,
    ) -> HandlerFuture<'_, QueryAppMetadataResp>;

    fn query_host_proc_attr_list(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: QueryHostProcAttrListReq,
    ) -> HandlerFuture<'_, QueryHostProcAttrListResp>;

    fn plugin_info(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: PluginInfoReq,
    ) -> HandlerFuture<'_, PluginInfoResp>;

    fn effect_report(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: EffectReportReq,
    ) -> HandlerFuture<'_, EffectReportResp>;

    fn pull_release(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: PullReleaseReq,
    ) -> HandlerFuture<'_, PullReleaseResp>;

    fn pull_config_list(
        &self,
        sequence_id: u64,
        agent: Agent,
        req: PullConfigListReq,
    ) -> HandlerFuture<'_, PullConfigListResp>;

    /// Callbacks handed to the session registry when a `PluginInfo` instance
    /// is flushed. Default: none.
    fn session_hooks(&self) -> SessionHooks {
        SessionHooks::default()
    }
}

/// Answers every command with an empty response.
///
/// Used by the binary until real business services are wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandlers;

fn empty<T: Default + Send + 'static>(
    cmd: &'static str,
    sequence_id: u64,
    agent: &Agent,
) -> HandlerFuture<'static, T> {
    debug!(cmd, sequence_id, agent = %agent, "Default handler: empty response");
    futures::future::ready(Ok(T::default())).boxed()
}

impl BusinessHandlers for DefaultHandlers {
    fn query_app_metadata(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: QueryAppMetadataReq,
    ) -> HandlerFuture<'_, QueryAppMetadataResp> {
        empty("query_app_metadata", sequence_id, &agent)
    }

    fn query_host_proc_attr_list(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: QueryHostProcAttrListReq,
    ) -> HandlerFuture<'_, QueryHostProcAttrListResp> {
        empty("query_host_procattr_list", sequence_id, &agent)
    }

    fn plugin_info(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: PluginInfoReq,
    ) -> HandlerFuture<'_, PluginInfoResp> {
        empty("plugin_info", sequence_id, &agent)
    }

    fn effect_report(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: EffectReportReq,
    ) -> HandlerFuture<'_, EffectReportResp> {
        empty("effect_report", sequence_id, &agent)
    }

    fn pull_release(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: PullReleaseReq,
    ) -> HandlerFuture<'_, PullReleaseResp> {
        empty("pull_release", sequence_id, &agent)
    }

    fn pull_config_list(
        &self,
        sequence_id: u64,
        agent: Agent,
        _req: PullConfigListReq,
    ) -> HandlerFuture<'_, PullConfigListResp> {
        empty("pull_configlist", sequence_id, &agent)
    }
}
