//! Network plumbing.
//!
//! The capabilities here are deliberately small traits so that the trace
//! layer can wrap them and tests can substitute in-memory fakes:
//!
//! ```text
//!   Resolver ──► Dialer ──► TlsHandshaker ──► TlsDialer ──► HttpTransport
//!                   │
//!                   └──► QuicDialer
//! ```
//!
//! Every call takes a [`CancellationToken`]; a cancelled token aborts the
//! in-flight primitive with an `interrupted` failure.

pub mod asn;
pub mod bytecounter;
pub mod dialer;
pub mod http;
pub mod quic;
pub mod resolver;
pub mod tls;

use crate::error::NetError;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub use asn::{AsnDatabase, AsnError, AsnLookup};
pub use bytecounter::{ByteCounter, ByteCountingTransport};
pub use dialer::{DialerWithResolver, TcpDialer};
pub use http::{EngineHttpTransport, HttpTransport};
pub use quic::{QuicConnection, QuinnQuicDialer};
pub use resolver::SystemResolver;
pub use tls::RustlsHandshaker;

/// A bidirectional byte stream.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {
    /// Address of the remote peer, when known.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// An owned, type-erased connection.
pub type BoxedConn = Box<dyn Conn>;

impl Conn for TcpStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl Conn for DuplexStream {}

impl Conn for tokio_rustls::client::TlsStream<BoxedConn> {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.remote_addr()
    }
}

/// Establishes stream connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `address` (an `ip:port` or `host:port` endpoint) over `network`
    /// (`tcp`, `tcp4`, `tcp6`).
    async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<BoxedConn, NetError>;

    /// Release any pooled connection the dialer keeps.
    fn close_idle_connections(&self) {}
}

/// Establishes TLS connections to a `host:port` endpoint, taking care of
/// resolution, TCP dialing and the handshake.
#[async_trait]
pub trait TlsDialer: Send + Sync {
    async fn dial_tls(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<BoxedConn, NetError>;

    fn close_idle_connections(&self) {}
}

/// TLS parameters for a single handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Value of the SNI extension; empty disables SNI.
    pub server_name: String,
    /// Hostname to verify the certificate against. `None` means "same as
    /// `server_name`".
    pub verify_hostname: Option<String>,
    /// Skip certificate verification altogether.
    pub insecure_skip_verify: bool,
    /// ALPN protocols to offer.
    pub alpn: Vec<String>,
}

impl TlsConfig {
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_alpn(mut self, alpn: &[&str]) -> Self {
        self.alpn = alpn.iter().map(|p| (*p).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_verify_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.verify_hostname = Some(hostname.into());
        self
    }

    /// The hostname the certificate must be valid for.
    #[must_use]
    pub fn effective_verify_hostname(&self) -> &str {
        self.verify_hostname.as_deref().unwrap_or(&self.server_name)
    }
}

/// What we learned from a completed handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionState {
    pub cipher_suite: String,
    pub tls_version: String,
    pub negotiated_protocol: String,
    /// DER-encoded peer certificates, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Performs TLS handshakes over established connections.
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    async fn handshake(
        &self,
        cancel: &CancellationToken,
        conn: BoxedConn,
        config: &TlsConfig,
    ) -> Result<(BoxedConn, TlsConnectionState), NetError>;
}

/// Establishes QUIC connections (dial and handshake in one step).
#[async_trait]
pub trait QuicDialer: Send + Sync {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        address: &str,
        config: &TlsConfig,
    ) -> Result<QuicConnection, NetError>;
}

/// Resolves domain names.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(
        &self,
        cancel: &CancellationToken,
        domain: &str,
    ) -> Result<Vec<IpAddr>, NetError>;

    /// Name of the resolver kind, for logging.
    fn network(&self) -> &'static str;

    fn close_idle_connections(&self);
}

/// Error returned by [`split_host_port`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("missing port in address: {0}")]
    MissingPort(String),
    #[error("too many colons in address: {0}")]
    TooManyColons(String),
    #[error("missing ']' in address: {0}")]
    MissingBracket(String),
}

/// Split `host:port` or `[v6]:port` into host and port.
pub fn split_host_port(endpoint: &str) -> Result<(String, String), AddrError> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(AddrError::MissingBracket(endpoint.to_string()));
        };
        let Some(port) = tail.strip_prefix(':') else {
            return Err(AddrError::MissingPort(endpoint.to_string()));
        };
        return Ok((host.to_string(), port.to_string()));
    }
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return Err(AddrError::MissingPort(endpoint.to_string()));
    };
    if host.contains(':') {
        return Err(AddrError::TooManyColons(endpoint.to_string()));
    }
    Ok((host.to_string(), port.to_string()))
}

/// Inverse of [`split_host_port`]: brackets IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
