//! Plain TCP and rustls connections to data nodes.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::routing::cfg_json::host_from_host_port;

/// Byte stream a memd connection runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A freshly dialed connection.
pub struct Connection {
    pub stream: BoxedStream,
    pub local_addr: String,
    pub remote_addr: String,
}

/// Opens connections to `host:port` addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str, deadline: Instant) -> CoreResult<Connection>;
}

async fn dial_tcp(address: &str, deadline: Instant) -> CoreResult<TcpStream> {
    let stream = tokio::time::timeout_at(deadline.into(), TcpStream::connect(address))
        .await
        .map_err(|_| CoreError::message(ErrorKind::ConnectFailed, format!("connect to {address} timed out")))?
        .map_err(|e| CoreError::message(ErrorKind::ConnectFailed, format!("connect to {address}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| CoreError::message(ErrorKind::ConnectFailed, e.to_string()))?;
    Ok(stream)
}

fn addrs_of(stream: &TcpStream, address: &str) -> (String, String) {
    let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let remote = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| address.to_string());
    (local, remote)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str, deadline: Instant) -> CoreResult<Connection> {
        let stream = dial_tcp(address, deadline).await?;
        let (local_addr, remote_addr) = addrs_of(&stream, address);
        debug!(address, local = %local_addr, "TCP connection established");
        Ok(Connection {
            stream: Box::new(stream),
            local_addr,
            remote_addr,
        })
    }
}

/// TLS over TCP, verifying the server against a CA bundle.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Builds a connector trusting the PEM certificates in `ca_path`.
    pub fn from_ca_file(ca_path: &Path) -> CoreResult<Self> {
        let file = File::open(ca_path).map_err(|e| {
            CoreError::message(ErrorKind::InvalidArgument, format!("open {}: {e}", ca_path.display()))
        })?;
        let mut reader = BufReader::new(file);
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| CoreError::invalid_argument(format!("invalid CA certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| CoreError::invalid_argument(format!("invalid CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(CoreError::invalid_argument(format!(
                "no certificates found in {}",
                ca_path.display()
            )));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| CoreError::message(ErrorKind::TlsHandshake, e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, address: &str, deadline: Instant) -> CoreResult<Connection> {
        let tcp = dial_tcp(address, deadline).await?;
        let (local_addr, remote_addr) = addrs_of(&tcp, address);
        let server_name = ServerName::try_from(host_from_host_port(address).to_string())
            .map_err(|e| CoreError::message(ErrorKind::TlsHandshake, format!("invalid server name: {e}")))?;
        let stream = tokio::time::timeout_at(deadline.into(), self.inner.connect(server_name, tcp))
            .await
            .map_err(|_| CoreError::message(ErrorKind::TlsHandshake, format!("TLS handshake with {address} timed out")))?
            .map_err(|e| CoreError::message(ErrorKind::TlsHandshake, format!("TLS handshake with {address}: {e}")))?;
        debug!(address, local = %local_addr, "TLS connection established");
        Ok(Connection {
            stream: Box::new(stream),
            local_addr,
            remote_addr,
        })
    }
}

/// Picks the connector for the configured security settings.
pub fn connector_for(use_tls: bool, ca_path: Option<&Path>) -> CoreResult<Arc<dyn Connector>> {
    if !use_tls {
        return Ok(Arc::new(TcpConnector));
    }
    let path = ca_path.ok_or_else(|| CoreError::invalid_argument("TLS requires ca_cert_path"))?;
    Ok(Arc::new(TlsConnector::from_ca_file(path)?))
}
