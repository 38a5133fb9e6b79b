//! TLS transport to GSE endpoints.
//!
//! [`client_config`] builds a rustls client from PEM files (CA bundle, plus an
//! optional client certificate for mutual TLS). [`TlsDialer`] opens one TCP
//! connection per registration attempt, tunes the socket before the
//! handshake and wraps it in TLS.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{EndpointConfig, TlsConfig};
use crate::error::TunnelError;
use crate::tunnel::{BoxedStream, Dialer};

fn read_pem(path: &str) -> Result<Vec<u8>, TunnelError> {
    std::fs::read(path).map_err(|e| TunnelError::Tls(format!("read {path}: {e}")))
}

fn parse_certificates(
    pem: &[u8],
    path: &str,
) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Tls(format!("parse certificates in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!("no certificates in {path}")));
    }
    Ok(certs)
}

/// Build the rustls client configuration shared by all endpoints.
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>, TunnelError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(&read_pem(&tls.ca_file)?, &tls.ca_file)? {
        roots
            .add(cert)
            .map_err(|e| TunnelError::Tls(format!("add CA certificate: {e}")))?;
    }

    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::Tls(format!("protocol versions: {e}")))?
            .with_root_certificates(roots);

    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let chain = parse_certificates(&read_pem(cert_file)?, cert_file)?;
            let key = PrivateKeyDer::from_pem_slice(&read_pem(key_file)?)
                .map_err(|e| TunnelError::Tls(format!("parse private key in {key_file}: {e}")))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TunnelError::Tls(format!("client certificate: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_keepalive_idle(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};
    let secs = u32::try_from(idle.as_secs()).unwrap_or(u32::MAX).max(1);
    setsockopt(stream, sockopt::TcpKeepIdle, &secs).map_err(io::Error::from)
}

/// Other platforms keep the system default idle time.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_keepalive_idle(_stream: &TcpStream, _idle: Duration) -> io::Result<()> {
    Ok(())
}

/// Dials one endpoint over TCP + TLS.
pub struct TlsDialer {
    address: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    read_buffer_size: u32,
    write_buffer_size: u32,
    keepalive: Option<Duration>,
}

impl TlsDialer {
    pub fn new(endpoint: &EndpointConfig, tls: &TlsConfig) -> Result<Self, TunnelError> {
        Self::with_client_config(endpoint, client_config(tls)?)
    }

    pub fn with_client_config(
        endpoint: &EndpointConfig,
        config: Arc<ClientConfig>,
    ) -> Result<Self, TunnelError> {
        let server_name = ServerName::try_from(endpoint.server_name.clone()).map_err(|e| {
            TunnelError::Tls(format!("invalid server name {:?}: {e}", endpoint.server_name))
        })?;
        Ok(Self {
            address: endpoint.address.clone(),
            server_name,
            connector: TlsConnector::from(config),
            read_buffer_size: endpoint.read_buffer_size,
            write_buffer_size: endpoint.write_buffer_size,
            keepalive: endpoint.keepalive,
        })
    }

    /// Socket tuning applied before the handshake starts.
    fn socket_for(&self, addr: SocketAddr) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_recv_buffer_size(self.read_buffer_size)?;
        socket.set_send_buffer_size(self.write_buffer_size)?;
        socket.set_keepalive(self.keepalive.is_some())?;
        Ok(socket)
    }

    fn tune(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            set_keepalive_idle(stream, idle)?;
        }
        Ok(())
    }

    async fn connect_tcp(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host(self.address.as_str()).await? {
            match self.socket_for(addr)?.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(endpoint = %self.address, %addr, "Tunnel: connect failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.address),
            )
        }))
    }

    async fn connect(&self) -> io::Result<BoxedStream> {
        let tcp = self.connect_tcp().await?;
        self.tune(&tcp)?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        Ok(Box::new(tls))
    }
}

impl Dialer for TlsDialer {
    fn dial(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        self.connect().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ca_file() {
        let tls = TlsConfig {
            ca_file: "/nonexistent/ca.pem".into(),
            cert_file: None,
            key_file: None,
        };
        let err = client_config(&tls).unwrap_err();
        assert!(matches!(err, TunnelError::Tls(msg) if msg.contains("/nonexistent/ca.pem")));
    }

    #[test]
    fn test_empty_pem_has_no_certificates() {
        let err = parse_certificates(b"not a pem file", "inline").unwrap_err();
        assert!(matches!(err, TunnelError::Tls(msg) if msg.contains("no certificates")));
    }
}
