//! Connection manager: one [`Connection`] per configured endpoint.
//!
//! Construction is all-or-nothing: if any endpoint fails its first
//! registration, connections already started are closed and `init` fails.
//! After that every endpoint reconnects on its own. Calling `init` again
//! closes the current set before dialing.

use std::sync::Arc;

use futures::future::join_all;
use prost::Message;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::connection::{ConnState, Connection, Dialer};
use super::queue::PushError;
use super::writer::PushHandle;
use super::Services;
use crate::config::{EndpointConfig, TunnelConfig};
use crate::error::{RegistryError, TunnelError};
use crate::observe::names;
use crate::protocol::{Agent, Cmd};
use crate::tls::TlsDialer;

/// Builds the dialer for one endpoint.
pub type DialerFactory =
    Arc<dyn Fn(&EndpointConfig) -> Result<Arc<dyn Dialer>, TunnelError> + Send + Sync>;

pub struct ConnectionManager {
    config: TunnelConfig,
    services: Services,
    dialers: DialerFactory,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionManager {
    /// Manager dialing real TLS endpoints.
    pub fn new(config: TunnelConfig, services: Services) -> Self {
        let tls = config.tls.clone();
        let dialers: DialerFactory = Arc::new(
            move |endpoint: &EndpointConfig| -> Result<Arc<dyn Dialer>, TunnelError> {
                let dialer: Arc<dyn Dialer> = Arc::new(TlsDialer::new(endpoint, &tls)?);
                Ok(dialer)
            },
        );
        Self::with_dialer_factory(config, services, dialers)
    }

    pub fn with_dialer_factory(
        config: TunnelConfig,
        services: Services,
        dialers: DialerFactory,
    ) -> Self {
        Self {
            config,
            services,
            dialers,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Register with every endpoint.
    pub async fn init(&self) -> Result<(), TunnelError> {
        let endpoints = self.config.endpoints()?;
        let previous = std::mem::take(&mut *self.connections.lock().await);
        if !previous.is_empty() {
            info!(connections = previous.len(), "Tunnel: re-init, closing current connections");
            join_all(previous.iter().map(|c| c.close())).await;
        }
        let mut started = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let address = endpoint.address.clone();
            let result = match (self.dialers)(&endpoint) {
                Ok(dialer) => Connection::init(endpoint, dialer, self.services.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(conn) => started.push(Arc::new(conn)),
                Err(e) => {
                    warn!(endpoint = %address, "Tunnel: init failed: {e}");
                    join_all(started.iter().map(|c: &Arc<Connection>| c.close())).await;
                    return Err(e);
                }
            }
        }
        info!(connections = started.len(), "Tunnel: all endpoints registered");
        *self.connections.lock().await = started;
        Ok(())
    }

    /// Close every connection. Safe to call more than once.
    pub async fn close(&self) {
        let connections = std::mem::take(&mut *self.connections.lock().await);
        join_all(connections.iter().map(|c| c.close())).await;
    }

    /// `(endpoint, state)` for every connection.
    pub async fn states(&self) -> Vec<(String, ConnState)> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|c| (c.endpoint().to_string(), c.state()))
            .collect()
    }

    pub async fn push_handles(&self) -> Vec<PushHandle> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|c| c.push_handle())
            .collect()
    }

    /// Push one notification through every connection. Returns how many
    /// connections accepted it.
    pub async fn broadcast(
        &self,
        sequence_id: u64,
        agents: &[Agent],
        cmd: Cmd,
        payload: &impl Message,
    ) -> usize {
        let connections = self.connections.lock().await.clone();
        let mut accepted = 0;
        for conn in connections {
            let reason = match conn
                .push_handle()
                .notify(sequence_id, agents.to_vec(), cmd, payload)
                .await
            {
                Ok(()) => {
                    accepted += 1;
                    continue;
                }
                Err(PushError::Fused) => "fused",
                Err(PushError::Closed) => "closed",
            };
            warn!(
                endpoint = %conn.endpoint(),
                sequence_id,
                cmd = cmd.as_str(),
                "Tunnel: broadcast not enqueued ({reason})"
            );
            self.services.observer.inc_counter(
                names::PUSH_FAILED,
                &[("endpoint", conn.endpoint()), ("reason", reason)],
            );
        }
        accepted
    }

    /// Live plugin sessions known to the registry. Also published as a gauge.
    pub fn session_count(&self) -> Result<usize, RegistryError> {
        let count = self.services.registry.session_count()?;
        self.services
            .observer
            .observe_gauge(names::SESSION_COUNT, &[], count as f64);
        Ok(count)
    }
}
