//! QUIC handshakes with quinn.

use super::tls::{DEFAULT_TLS_HANDSHAKE_TIMEOUT, build_client_config};
use super::{QuicDialer, TlsConfig, TlsConnectionState};
use crate::error::{FailureKind, NetError, Operation};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An established QUIC connection together with the endpoint that owns its
/// UDP socket.
#[derive(Debug)]
pub struct QuicConnection {
    pub remote_addr: SocketAddr,
    pub state: TlsConnectionState,
    connection: Option<quinn::Connection>,
    endpoint: Option<quinn::Endpoint>,
}

impl QuicConnection {
    /// A connection that carries handshake state only. Used by fakes.
    #[must_use]
    pub fn detached(remote_addr: SocketAddr, state: TlsConnectionState) -> Self {
        Self {
            remote_addr,
            state,
            connection: None,
            endpoint: None,
        }
    }

    /// Close the connection and wait for the endpoint to go idle.
    pub async fn close(self) {
        if let Some(conn) = self.connection {
            conn.close(0u32.into(), b"");
        }
        if let Some(endpoint) = self.endpoint {
            endpoint.wait_idle().await;
        }
    }
}

fn classify_connection_error(err: &quinn::ConnectionError) -> FailureKind {
    match err {
        quinn::ConnectionError::TimedOut => FailureKind::GenericTimeout,
        quinn::ConnectionError::Reset => FailureKind::ConnectionReset,
        quinn::ConnectionError::ConnectionClosed(_) | quinn::ConnectionError::TransportError(_) => {
            FailureKind::SslFailedHandshake
        }
        other => FailureKind::Unknown(other.to_string()),
    }
}

/// QUIC dialer that creates one client endpoint per connection.
#[derive(Debug, Clone)]
pub struct QuinnQuicDialer {
    timeout: Duration,
}

impl Default for QuinnQuicDialer {
    fn default() -> Self {
        Self::new(DEFAULT_TLS_HANDSHAKE_TIMEOUT)
    }
}

impl QuinnQuicDialer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl QuicDialer for QuinnQuicDialer {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        address: &str,
        config: &TlsConfig,
    ) -> Result<QuicConnection, NetError> {
        let remote: SocketAddr = address.parse().map_err(|_| {
            NetError::new(
                FailureKind::Unknown(format!("not an IP endpoint: {address}")),
                Operation::QuicHandshake,
            )
        })?;
        let (crypto, server_name) =
            build_client_config(config, &[&rustls::version::TLS13]).map_err(|e| {
                NetError::new(e.kind().clone(), Operation::QuicHandshake)
            })?;
        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(|e| {
            NetError::new(
                FailureKind::Unknown(format!("quic config: {e}")),
                Operation::QuicHandshake,
            )
        })?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let mut endpoint = quinn::Endpoint::client(bind)
            .map_err(|e| NetError::from_io(e, Operation::QuicHandshake))?;
        endpoint.set_default_client_config(client_config);

        debug!(%remote, sni = %config.server_name, "quic handshake");
        let connecting = endpoint
            .connect(remote, &server_name.to_str())
            .map_err(|e| {
                NetError::new(
                    FailureKind::Unknown(e.to_string()),
                    Operation::QuicHandshake,
                )
            })?;

        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                endpoint.close(0u32.into(), b"");
                return Err(NetError::interrupted(Operation::QuicHandshake));
            }
            res = tokio::time::timeout(self.timeout, connecting) => match res {
                Err(_) => {
                    endpoint.close(0u32.into(), b"");
                    return Err(NetError::timeout(Operation::QuicHandshake));
                }
                Ok(Err(e)) => {
                    return Err(NetError::new(classify_connection_error(&e), Operation::QuicHandshake)
                        .with_source(e));
                }
                Ok(Ok(connection)) => connection,
            },
        };

        let negotiated_protocol = connection
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
            .and_then(|data| data.protocol)
            .map(|p| String::from_utf8_lossy(&p).into_owned())
            .unwrap_or_default();
        let peer_certificates = connection
            .peer_identity()
            .and_then(|id| {
                id.downcast::<Vec<rustls::pki_types::CertificateDer<'static>>>()
                    .ok()
            })
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();

        Ok(QuicConnection {
            remote_addr: remote,
            state: TlsConnectionState {
                // QUIC mandates TLS 1.3; quinn does not expose the suite.
                cipher_suite: String::new(),
                tls_version: "TLSv1.3".to_string(),
                negotiated_protocol,
                peer_certificates,
            },
            connection: Some(connection),
            endpoint: Some(endpoint),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert_eq!(
            classify_connection_error(&quinn::ConnectionError::TimedOut),
            FailureKind::GenericTimeout
        );
        assert_eq!(
            classify_connection_error(&quinn::ConnectionError::Reset),
            FailureKind::ConnectionReset
        );
    }

    #[tokio::test]
    async fn test_quic_dial_rejects_domain_endpoint() {
        let err = QuinnQuicDialer::default()
            .dial(
                &CancellationToken::new(),
                "example.com:443",
                &TlsConfig::new("example.com"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.operation(), Operation::QuicHandshake);
    }

    #[tokio::test]
    async fn test_quic_dial_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = QuinnQuicDialer::default()
            .dial(&cancel, "192.0.2.1:443", &TlsConfig::new("example.com"))
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
    }
}
