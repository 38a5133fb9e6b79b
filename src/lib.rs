#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! gse-tunnel library: persistent tunnel between the config service and GSE
//! task-servers.
//!
//! - `protocol` — binary framing, platform JSON bodies, protobuf envelope
//! - `tunnel` — connections, reader/writer/dispatcher, command worker pools
//! - `tls` — rustls client and socket-tuning dialer
//! - `handlers` — business-handler port
//! - `registry` — plugin session registry port + in-memory registry
//! - `observe` — metrics port
//! - `config` — configuration loading

pub mod config;
pub mod error;
pub mod handlers;
pub mod observe;
pub mod protocol;
pub mod registry;
pub mod tls;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::TunnelError;
pub use handlers::{BusinessHandlers, DefaultHandlers};
pub use observe::{CounterObserver, Observer};
pub use registry::{MemoryRegistry, SessionRegistry};
pub use tunnel::{ConnectionManager, PushHandle, Services};
