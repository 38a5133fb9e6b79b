//! Application envelope and command payloads (protobuf).
//!
//! After base64-decoding a platform `Message` we get an [`Envelope`]
//! `{ seq, cmd, data }`. [`Request::decode`] turns `(cmd, data)` into one
//! variant per command so routing is a plain `match` and each payload is
//! decoded exactly once.

use prost::Message;

use crate::error::BodyError;

/// Application command carried in [`Envelope::cmd`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Cmd {
    Unspecified = 0,
    QueryAppMetadata = 1,
    QueryHostProcattrList = 2,
    PluginInfo = 3,
    EffectReport = 4,
    PullRelease = 5,
    PullConfiglist = 6,
    // Push-only notifications, never accepted inbound.
    NotifyPublish = 101,
    NotifyRollback = 102,
    NotifyReload = 103,
}

impl Cmd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::QueryAppMetadata => "query_app_metadata",
            Self::QueryHostProcattrList => "query_host_procattr_list",
            Self::PluginInfo => "plugin_info",
            Self::EffectReport => "effect_report",
            Self::PullRelease => "pull_release",
            Self::PullConfiglist => "pull_configlist",
            Self::NotifyPublish => "notify_publish",
            Self::NotifyRollback => "notify_rollback",
            Self::NotifyReload => "notify_reload",
        }
    }
}

/// `{ Seq, Cmd, Data }`.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(enumeration = "Cmd", tag = "2")]
    pub cmd: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(seq: u64, cmd: Cmd, payload: &impl Message) -> Self {
        Self {
            seq,
            cmd: cmd as i32,
            data: payload.encode_to_vec(),
        }
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, BodyError> {
        Ok(Self::decode(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct QueryAppMetadataReq {
    #[prost(uint32, tag = "1")]
    pub biz_id: u32,
    #[prost(string, tag = "2")]
    pub app: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryAppMetadataResp {
    #[prost(uint32, tag = "1")]
    pub app_id: u32,
    #[prost(string, tag = "2")]
    pub config_type: String,
    #[prost(string, tag = "3")]
    pub uid: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryHostProcAttrListReq {
    #[prost(uint32, tag = "1")]
    pub biz_id: u32,
    #[prost(string, tag = "2")]
    pub host_ip: String,
    #[prost(uint32, tag = "3")]
    pub cloud_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProcAttr {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryHostProcAttrListResp {
    #[prost(message, repeated, tag = "1")]
    pub attrs: Vec<ProcAttr>,
}

/// One sidecar instance announced by a `PluginInfo` request.
#[derive(Clone, PartialEq, Message)]
pub struct PluginInstance {
    #[prost(string, tag = "1")]
    pub instance_id: String,
    #[prost(uint32, tag = "2")]
    pub biz_id: u32,
    #[prost(string, tag = "3")]
    pub app: String,
    /// Session TTL in seconds. Zero means the instance is going away.
    #[prost(uint32, tag = "4")]
    pub timeout: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PluginInfoReq {
    #[prost(message, repeated, tag = "1")]
    pub instances: Vec<PluginInstance>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PluginInfoResp {}

#[derive(Clone, PartialEq, Message)]
pub struct EffectReportReq {
    #[prost(uint32, tag = "1")]
    pub biz_id: u32,
    #[prost(uint32, tag = "2")]
    pub app_id: u32,
    #[prost(uint32, tag = "3")]
    pub release_id: u32,
    #[prost(int32, tag = "4")]
    pub status: i32,
    #[prost(string, tag = "5")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct EffectReportResp {}

#[derive(Clone, PartialEq, Message)]
pub struct PullReleaseReq {
    #[prost(uint32, tag = "1")]
    pub biz_id: u32,
    #[prost(uint32, tag = "2")]
    pub app_id: u32,
    #[prost(string, tag = "3")]
    pub uid: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConfigItemMeta {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub sha256: String,
    #[prost(uint64, tag = "4")]
    pub byte_size: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PullReleaseResp {
    #[prost(uint32, tag = "1")]
    pub release_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub items: Vec<ConfigItemMeta>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PullConfigListReq {
    #[prost(uint32, tag = "1")]
    pub biz_id: u32,
    #[prost(uint32, tag = "2")]
    pub app_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PullConfigListResp {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<ConfigItemMeta>,
}

/// A decoded inbound request, one variant per handled [`Cmd`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    QueryAppMetadata(QueryAppMetadataReq),
    QueryHostProcAttrList(QueryHostProcAttrListReq),
    PluginInfo(PluginInfoReq),
    EffectReport(EffectReportReq),
    PullRelease(PullReleaseReq),
    PullConfigList(PullConfigListReq),
}

impl Request {
    /// Decode the payload for `cmd`. Push-only and unknown commands are rejected.
    pub fn decode(cmd: i32, data: &[u8]) -> Result<Self, BodyError> {
        let Ok(known) = Cmd::try_from(cmd) else {
            return Err(BodyError::UnknownCommand(cmd));
        };
        let request = match known {
            Cmd::QueryAppMetadata => Self::QueryAppMetadata(QueryAppMetadataReq::decode(data)?),
            Cmd::QueryHostProcattrList => {
                Self::QueryHostProcAttrList(QueryHostProcAttrListReq::decode(data)?)
            }
            Cmd::PluginInfo => Self::PluginInfo(PluginInfoReq::decode(data)?),
            Cmd::EffectReport => Self::EffectReport(EffectReportReq::decode(data)?),
            Cmd::PullRelease => Self::PullRelease(PullReleaseReq::decode(data)?),
            Cmd::PullConfiglist => Self::PullConfigList(PullConfigListReq::decode(data)?),
            Cmd::Unspecified | Cmd::NotifyPublish | Cmd::NotifyRollback | Cmd::NotifyReload => {
                return Err(BodyError::UnknownCommand(cmd));
            }
        };
        Ok(request)
    }

    pub fn cmd(&self) -> Cmd {
        match self {
            Self::QueryAppMetadata(_) => Cmd::QueryAppMetadata,
            Self::QueryHostProcAttrList(_) => Cmd::QueryHostProcattrList,
            Self::PluginInfo(_) => Cmd::PluginInfo,
            Self::EffectReport(_) => Cmd::EffectReport,
            Self::PullRelease(_) => Cmd::PullRelease,
            Self::PullConfigList(_) => Cmd::PullConfiglist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pull_release() {
        let req = PullReleaseReq {
            biz_id: 2,
            app_id: 9,
            uid: "u-1".into(),
        };
        let decoded = Request::decode(Cmd::PullRelease as i32, &req.encode_to_vec()).unwrap();
        assert_eq!(decoded, Request::PullRelease(req));
        assert_eq!(decoded.cmd(), Cmd::PullRelease);
    }

    #[test]
    fn test_unknown_and_push_only_commands_rejected() {
        for cmd in [0, 77, Cmd::NotifyReload as i32] {
            assert!(matches!(
                Request::decode(cmd, &[]),
                Err(BodyError::UnknownCommand(c)) if c == cmd
            ));
        }
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let err = Request::decode(Cmd::PluginInfo as i32, &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, BodyError::Protobuf(_)));
    }

    #[test]
    fn test_envelope_keeps_seq_and_cmd() {
        let env = Envelope::new(42, Cmd::PullRelease, &PullReleaseResp::default());
        let back = Envelope::decode_bytes(&env.encode_to_vec()).unwrap();
        assert_eq!(back.seq, 42);
        assert_eq!(back.cmd(), Cmd::PullRelease);
    }
}
