//! Error taxonomy for the tunnel engine.
//!
//! Only [`TunnelError`] and [`ConfigError`] ever leave the engine (from
//! `init`). Everything else is recovered or logged where it happens:
//!
//! - [`CodecError`] always ends the socket. [`CodecError::is_header_error`]
//!   tells stream corruption apart from a transport failure in the reconnect
//!   log line; bad bodies are [`BodyError`]s and only drop their frame.
//! - [`HandlerError`] and [`RegistryError`] are returned by the external
//!   collaborators and end up as a log line plus a counter.

use std::io;

use thiserror::Error;

/// Connection- and registration-level failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("framing error: {0}")]
    Codec(#[from] CodecError),

    /// The platform answered `Register` with something other than a success ack.
    #[error("registration rejected: {0}")]
    Register(String),

    #[error("no RegisterAck within {0:?}")]
    RegisterTimeout(std::time::Duration),

    /// The peer stopped draining the socket.
    #[error("write not completed within {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("connection closed")]
    Closed,
}

/// Wire framing errors produced by [`crate::protocol::codec::FrameCodec`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported header version {0}")]
    UnsupportedVersion(u16),

    #[error("body of {size} bytes exceeds maximum {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Header-level failures leave the byte stream in an unknown position;
    /// the only safe recovery is a fresh connection.
    pub fn is_header_error(&self) -> bool {
        matches!(
            self,
            Self::BadMagic(_) | Self::UnsupportedVersion(_) | Self::BodyTooLarge { .. }
        )
    }
}

/// Body decoding failures. Always scoped to one frame.
#[derive(Debug, Error)]
pub enum BodyError {
    /// Malformed JSON, including an undecodable base64 `Message`.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("unsupported command {0}")]
    UnknownCommand(i32),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("no upstream endpoints configured")]
    NoEndpoints,

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure reported by a business handler. The request is answered with silence.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure reported by the session registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}
