//! Tunnel engine: persistent sessions to GSE task-servers.
//!
//! Per upstream endpoint a [`Connection`] runs:
//!
//! ```text
//! socket ─► reader ─► recv queue ─► dispatcher ─► 6 command queues ─► worker pools
//!             │                                                          │
//!             └──── immediate ack ──► outbound queue ◄──── responses ────┘
//!                                          │
//!                                     writer pool ─► socket
//! ```
//!
//! All hand-offs are bounded queues with timeout-bounded enqueue
//! ([`queue`]). The only lock is the per-connection write guard.

pub mod connection;
pub mod dispatcher;
pub mod manager;
pub mod queue;
pub mod reader;
pub mod workers;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use crate::handlers::BusinessHandlers;
use crate::observe::Observer;
use crate::registry::SessionRegistry;

pub use connection::{BoxedStream, ConnState, Connection, Dialer};
pub use dispatcher::RecvTask;
pub use manager::ConnectionManager;
pub use writer::{PushHandle, SendTask};

/// External collaborators handed to every connection.
#[derive(Clone)]
pub struct Services {
    pub handlers: Arc<dyn BusinessHandlers>,
    pub registry: Arc<dyn SessionRegistry>,
    pub observer: Arc<dyn Observer>,
}
