//! Binary frame codec: fixed header + opaque body.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! 0      4        6        8             12            16            24             32          36
//! | magic | version | reserved | message_type | service_id | session_id | sequence_id | body_len | body...
//! ```
//!
//! The decoder yields exactly one complete [`Frame`] per item and never
//! splits a body across items.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// `"GSE1"`.
pub const MAGIC: u32 = 0x4753_4531;
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 36;
/// Upper bound on a single body. Anything larger is treated as stream corruption.
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// Platform-level message type carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    RegisterAck,
    SubscribeFromPlugin,
    SubscribeFromPluginAck,
    PushToPlugin,
    PushToPluginAck,
    /// A type this engine does not handle. Kept so the reader can log it.
    Unknown(u32),
}

impl MessageType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Register => 1,
            Self::RegisterAck => 2,
            Self::SubscribeFromPlugin => 3,
            Self::SubscribeFromPluginAck => 4,
            Self::PushToPlugin => 5,
            Self::PushToPluginAck => 6,
            Self::Unknown(v) => v,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::RegisterAck => "register_ack",
            Self::SubscribeFromPlugin => "subscribe_from_plugin",
            Self::SubscribeFromPluginAck => "subscribe_from_plugin_ack",
            Self::PushToPlugin => "push_to_plugin",
            Self::PushToPluginAck => "push_to_plugin_ack",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u32> for MessageType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Register,
            2 => Self::RegisterAck,
            3 => Self::SubscribeFromPlugin,
            4 => Self::SubscribeFromPluginAck,
            5 => Self::PushToPlugin,
            6 => Self::PushToPluginAck,
            other => Self::Unknown(other),
        }
    }
}

/// The header fields the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub service_id: u32,
    pub session_id: u64,
    pub sequence_id: u64,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }
}

/// `tokio_util` codec for [`Frame`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate before consuming so a rejected header leaves `src` untouched.
        let mut peek = &src[..HEADER_LEN];
        let magic = peek.get_u32();
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = peek.get_u16();
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let _reserved = peek.get_u16();
        let message_type = MessageType::from(peek.get_u32());
        let service_id = peek.get_u32();
        let session_id = peek.get_u64();
        let sequence_id = peek.get_u64();
        let body_len = peek.get_u32() as usize;
        if body_len > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_LEN,
            });
        }

        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Frame {
            header: Header {
                message_type,
                service_id,
                session_id,
                sequence_id,
            },
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body_len = frame.body.len();
        if body_len > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_LEN,
            });
        }
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u32(MAGIC);
        dst.put_u16(VERSION);
        dst.put_u16(0);
        dst.put_u32(frame.header.message_type.as_u32());
        dst.put_u32(frame.header.service_id);
        dst.put_u64(frame.header.session_id);
        dst.put_u64(frame.header.sequence_id);
        dst.put_u32(body_len as u32);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(message_type: MessageType) -> Header {
        Header {
            message_type,
            service_id: 1001,
            session_id: 77,
            sequence_id: 42,
        }
    }

    #[test]
    fn test_decode_waits_for_full_body() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(
                Frame::new(header(MessageType::PushToPlugin), &b"{\"Agents\":[]}"[..]),
                &mut buf,
            )
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..HEADER_LEN + 3]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());

        let mut whole = full;
        let frame = FrameCodec.decode(&mut whole).unwrap().unwrap();
        assert_eq!(frame.header, header(MessageType::PushToPlugin));
        assert_eq!(&frame.body[..], b"{\"Agents\":[]}");
        assert!(whole.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::new(header(MessageType::Register), Bytes::new()), &mut buf)
            .unwrap();
        FrameCodec
            .encode(Frame::new(header(MessageType::RegisterAck), &b"x"[..]), &mut buf)
            .unwrap();

        let first = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let second = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.message_type, MessageType::Register);
        assert!(first.body.is_empty());
        assert_eq!(second.header.message_type, MessageType::RegisterAck);
        assert_eq!(&second.body[..], b"x");
    }

    #[test]
    fn test_bad_magic_is_header_error() {
        let mut buf = BytesMut::from(&[0u8; HEADER_LEN][..]);
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::BadMagic(0)));
        assert!(err.is_header_error());
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(0);
        buf.put_u32(3);
        buf.put_u32(1);
        buf.put_u64(1);
        buf.put_u64(1);
        buf.put_u32(u32::MAX);
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge { .. }));
    }

    #[test]
    fn test_unknown_message_type_is_preserved() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::new(header(MessageType::Unknown(99)), Bytes::new()), &mut buf)
            .unwrap();
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.message_type, MessageType::Unknown(99));
    }
}
