//! Platform-level JSON bodies carried inside [`Frame`](super::codec::Frame)s.
//!
//! The inner `Message` of plugin requests and pushes is raw bytes on our side
//! and base64 text on the wire.

use serde::{Deserialize, Serialize};

use crate::error::BodyError;

/// `ErrCode` value that means success.
pub const ERR_CODE_OK: i32 = 0;

/// Identity of the sidecar behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    #[serde(rename = "CloudID")]
    pub cloud_id: u32,
}

impl Agent {
    pub fn new(host_ip: impl Into<String>, cloud_id: u32) -> Self {
        Self {
            host_ip: host_ip.into(),
            cloud_id,
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.cloud_id, self.host_ip)
    }
}

/// Body of `RegisterAck`, `SubscribeFromPluginAck` and `PushToPluginAck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AckBody {
    pub err_code: i32,
    #[serde(default)]
    pub err_msg: String,
}

impl AckBody {
    pub fn ok() -> Self {
        Self {
            err_code: ERR_CODE_OK,
            err_msg: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err_code == ERR_CODE_OK
    }
}

/// Body of `SubscribeFromPlugin`: one request from one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeFromPlugin {
    pub agent: Agent,
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
}

/// Body of `PushToPlugin`: one message fanned out to many agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushToPlugin {
    pub agents: Vec<Agent>,
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
}

pub fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, BodyError> {
    Ok(serde_json::from_slice(body)?)
}

pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, BodyError> {
    Ok(serde_json::to_vec(body)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
