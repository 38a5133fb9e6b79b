//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `GSE_TUNNEL_ENDPOINTS` (comma-separated),
//!    `GSE_TUNNEL_SERVICE_ID`, `GSE_TUNNEL_LOG_LEVEL`
//! 2. **Config file** — path via `--config <path>`, or `gse-tunnel.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! stable_threshold = 60
//!
//! [tunnel]
//! service_id = 1001                        # assigned by the GSE operator
//! endpoints = ["gse-a.example.com:28668"]
//! server_name = "gse.example.com"          # optional TLS SNI override
//! reconnect_delay_ms = 3000                # fixed delay between attempts
//! register_timeout_ms = 5000
//! keepalive_secs = 60
//! read_buffer_size = 65536
//! write_buffer_size = 65536
//! writer_workers = 4
//! command_workers = 8
//! shutdown_grace_ms = 3000
//!
//! [tunnel.tls]
//! ca_file = "/etc/gse-tunnel/ca.pem"
//! cert_file = "/etc/gse-tunnel/client.pem"  # optional, enables mutual TLS
//! key_file = "/etc/gse-tunnel/client.key"
//!
//! [tunnel.queues]
//! recv = { capacity = 4096, timeout_ms = 100 }
//! send = { capacity = 4096, timeout_ms = 100 }
//!
//! [tunnel.queues.commands]
//! pull_release = { capacity = 2048, timeout_ms = 200 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::protocol::Cmd;

const DEFAULT_CONFIG_FILE: &str = "gse-tunnel.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `gse-tunnel supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

/// Settings shared by every upstream connection.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Service identifier assigned by the platform operator.
    #[serde(default)]
    pub service_id: u32,
    /// Upstream task-server addresses (`host:port`), one connection each.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// TLS server name. Defaults to the host part of each endpoint.
    pub server_name: Option<String>,
    /// Fixed delay between reconnect attempts in milliseconds (default 3000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// How long to wait for `RegisterAck` in milliseconds (default 5000).
    #[serde(default = "default_register_timeout_ms")]
    pub register_timeout_ms: u64,
    /// TCP keep-alive idle time in seconds (default 60, 0 disables).
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Socket receive buffer size in bytes (default 64 KiB).
    #[serde(default = "default_socket_buffer")]
    pub read_buffer_size: u32,
    /// Socket send buffer size in bytes (default 64 KiB).
    #[serde(default = "default_socket_buffer")]
    pub write_buffer_size: u32,
    /// Writer tasks draining the outbound queue (default 4).
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,
    /// Worker tasks per command pool (default 8).
    #[serde(default = "default_command_workers")]
    pub command_workers: usize,
    /// How long `close` waits for tasks to finish, in milliseconds (default 3000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
}

/// PEM material for the TLS session.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    /// CA bundle used to verify the platform.
    #[serde(default)]
    pub ca_file: String,
    /// Client certificate chain for mutual TLS.
    pub cert_file: Option<String>,
    /// Client private key for mutual TLS.
    pub key_file: Option<String>,
}

/// Capacity and enqueue timeout of one bounded queue.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueuesConfig {
    /// Reader → dispatcher.
    #[serde(default)]
    pub recv: QueueConfig,
    /// Outbound queue feeding the writer pool.
    #[serde(default)]
    pub send: QueueConfig,
    #[serde(default)]
    pub commands: CommandQueuesConfig,
}

/// One queue per application command.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CommandQueuesConfig {
    #[serde(default)]
    pub query_app_metadata: QueueConfig,
    #[serde(default)]
    pub query_host_procattr_list: QueueConfig,
    #[serde(default)]
    pub plugin_info: QueueConfig,
    #[serde(default)]
    pub effect_report: QueueConfig,
    #[serde(default)]
    pub pull_release: QueueConfig,
    #[serde(default)]
    pub pull_configlist: QueueConfig,
}

impl CommandQueuesConfig {
    /// Queue settings for a handled command, `None` for push-only ones.
    pub fn get(&self, cmd: Cmd) -> Option<QueueConfig> {
        match cmd {
            Cmd::QueryAppMetadata => Some(self.query_app_metadata),
            Cmd::QueryHostProcattrList => Some(self.query_host_procattr_list),
            Cmd::PluginInfo => Some(self.plugin_info),
            Cmd::EffectReport => Some(self.effect_report),
            Cmd::PullRelease => Some(self.pull_release),
            Cmd::PullConfiglist => Some(self.pull_configlist),
            Cmd::Unspecified | Cmd::NotifyPublish | Cmd::NotifyRollback | Cmd::NotifyReload => {
                None
            }
        }
    }
}

/// Immutable per-connection configuration derived from [`TunnelConfig`].
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub address: String,
    pub server_name: String,
    pub service_id: u32,
    pub reconnect_delay: Duration,
    pub register_timeout: Duration,
    /// `None` disables TCP keep-alive.
    pub keepalive: Option<Duration>,
    pub read_buffer_size: u32,
    pub write_buffer_size: u32,
    pub writer_workers: usize,
    pub command_workers: usize,
    pub shutdown_grace: Duration,
    pub queues: QueuesConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_register_timeout_ms() -> u64 {
    5000
}
fn default_keepalive_secs() -> u64 {
    60
}
fn default_socket_buffer() -> u32 {
    64 * 1024
}
fn default_writer_workers() -> usize {
    4
}
fn default_command_workers() -> usize {
    8
}
fn default_shutdown_grace_ms() -> u64 {
    3000
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_queue_timeout_ms() -> u64 {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            service_id: 0,
            endpoints: Vec::new(),
            server_name: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            register_timeout_ms: default_register_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            read_buffer_size: default_socket_buffer(),
            write_buffer_size: default_socket_buffer(),
            writer_workers: default_writer_workers(),
            command_workers: default_command_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            tls: TlsConfig::default(),
            queues: QueuesConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// One [`EndpointConfig`] per configured address.
    pub fn endpoints(&self) -> Result<Vec<EndpointConfig>, ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        self.endpoints
            .iter()
            .map(|address| {
                let server_name = match &self.server_name {
                    Some(name) => name.clone(),
                    None => host_of(address)?.to_string(),
                };
                Ok(EndpointConfig {
                    address: address.clone(),
                    server_name,
                    service_id: self.service_id,
                    reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
                    register_timeout: Duration::from_millis(self.register_timeout_ms),
                    keepalive: (self.keepalive_secs > 0)
                        .then(|| Duration::from_secs(self.keepalive_secs)),
                    read_buffer_size: self.read_buffer_size,
                    write_buffer_size: self.write_buffer_size,
                    writer_workers: self.writer_workers,
                    command_workers: self.command_workers,
                    shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
                    queues: self.queues.clone(),
                })
            })
            .collect()
    }

    /// Reject settings that would leave a pool or queue unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.writer_workers == 0 {
            return Err(invalid("tunnel.writer_workers", "must be at least 1"));
        }
        if self.command_workers == 0 {
            return Err(invalid("tunnel.command_workers", "must be at least 1"));
        }
        if self.tls.ca_file.is_empty() {
            return Err(invalid("tunnel.tls.ca_file", "must be set"));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(invalid(
                "tunnel.tls",
                "cert_file and key_file must be set together",
            ));
        }
        let c = &self.queues.commands;
        for (field, q) in [
            ("tunnel.queues.recv", &self.queues.recv),
            ("tunnel.queues.send", &self.queues.send),
            ("tunnel.queues.commands.query_app_metadata", &c.query_app_metadata),
            ("tunnel.queues.commands.query_host_procattr_list", &c.query_host_procattr_list),
            ("tunnel.queues.commands.plugin_info", &c.plugin_info),
            ("tunnel.queues.commands.effect_report", &c.effect_report),
            ("tunnel.queues.commands.pull_release", &c.pull_release),
            ("tunnel.queues.commands.pull_configlist", &c.pull_configlist),
        ] {
            if q.capacity == 0 {
                return Err(invalid(field, "capacity must be at least 1"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// `host:port` → `host`, handling bracketed IPv6 literals.
fn host_of(address: &str) -> Result<&str, ConfigError> {
    let host = if let Some(rest) = address.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        address.rsplit_once(':').map_or(address, |(h, _)| h)
    };
    if host.is_empty() {
        return Err(ConfigError::Invalid {
            field: "tunnel.endpoints",
            reason: format!("no host in {address:?}"),
        });
    }
    Ok(host)
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `gse-tunnel.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(endpoints) = std::env::var("GSE_TUNNEL_ENDPOINTS") {
            config.tunnel.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Ok(service_id) = std::env::var("GSE_TUNNEL_SERVICE_ID") {
            config.tunnel.service_id = service_id.parse().map_err(|e| ConfigError::Invalid {
                field: "GSE_TUNNEL_SERVICE_ID",
                reason: format!("{e}"),
            })?;
        }
        if let Ok(level) = std::env::var("GSE_TUNNEL_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
