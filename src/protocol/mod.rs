//! Wire protocol layers, outermost first:
//!
//! 1. [`codec`] — binary header + body framing on the TLS stream
//! 2. [`platform`] — JSON bodies exchanged with the GSE platform
//! 3. [`command`] — protobuf application envelope and command payloads

pub mod codec;
pub mod command;
pub mod platform;

pub use codec::{Frame, FrameCodec, Header, MessageType};
pub use command::{Cmd, Envelope, Request};
pub use platform::{AckBody, Agent, PushToPlugin, SubscribeFromPlugin};
