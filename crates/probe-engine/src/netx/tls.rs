//! TLS handshakes with rustls.
//!
//! Measurement needs to send one SNI while verifying the certificate against
//! another hostname (or against nothing at all). rustls ties both to the
//! `ServerName` given to `connect`, so we install a verifier that swaps in
//! the hostname we actually want to verify.

use super::{BoxedConn, TlsConfig, TlsConnectionState, TlsHandshaker};
use crate::error::{FailureKind, NetError, Operation};
use async_trait::async_trait;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ProtocolVersion, RootCertStore, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default timeout for a TLS handshake.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Verifies the server certificate against a fixed hostname, regardless of
/// the SNI that was sent.
#[derive(Debug)]
struct VerifyHostnameOverride {
    inner: Arc<WebPkiServerVerifier>,
    hostname: ServerName<'static>,
}

impl ServerCertVerifier for VerifyHostnameOverride {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.hostname, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate. Used when `insecure_skip_verify` is set.
#[derive(Debug)]
struct NoVerify {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn config_error(detail: impl std::fmt::Display) -> NetError {
    NetError::new(
        FailureKind::Unknown(format!("tls config: {detail}")),
        Operation::TlsHandshake,
    )
}

/// Build a rustls client configuration honouring SNI/verify separation.
///
/// `peer` is used as the server name when SNI is disabled.
pub(crate) fn build_client_config(
    config: &TlsConfig,
    versions: &[&'static rustls::SupportedProtocolVersion],
) -> Result<(ClientConfig, ServerName<'static>), NetError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = if config.insecure_skip_verify {
        Arc::new(NoVerify {
            provider: provider.clone(),
        })
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(config_error)?;
        let hostname = ServerName::try_from(config.effective_verify_hostname().to_string())
            .map_err(|e| NetError::new(FailureKind::SslInvalidHostname, Operation::TlsHandshake).with_source(e))?;
        Arc::new(VerifyHostnameOverride { inner, hostname })
    };

    let mut client = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(config_error)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    client.alpn_protocols = config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    client.enable_sni = !config.server_name.is_empty();

    // With SNI disabled rustls still wants a name; the verifier ignores it.
    let name = if config.server_name.is_empty() {
        config.effective_verify_hostname().to_string()
    } else {
        config.server_name.clone()
    };
    let name = if name.is_empty() { "invalid".to_string() } else { name };
    let server_name = ServerName::try_from(name)
        .map_err(|e| NetError::new(FailureKind::SslInvalidHostname, Operation::TlsHandshake).with_source(e))?;
    Ok((client, server_name))
}

/// String form of a TLS protocol version, as found in archival records.
#[must_use]
pub fn tls_version_string(version: Option<ProtocolVersion>) -> String {
    match version {
        Some(ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
        Some(ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
        Some(other) => format!("{other:?}"),
        None => String::new(),
    }
}

/// TLS handshaker backed by `tokio-rustls`.
#[derive(Debug, Clone)]
pub struct RustlsHandshaker {
    timeout: Duration,
}

impl Default for RustlsHandshaker {
    fn default() -> Self {
        Self::new(DEFAULT_TLS_HANDSHAKE_TIMEOUT)
    }
}

impl RustlsHandshaker {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TlsHandshaker for RustlsHandshaker {
    async fn handshake(
        &self,
        cancel: &CancellationToken,
        conn: BoxedConn,
        config: &TlsConfig,
    ) -> Result<(BoxedConn, TlsConnectionState), NetError> {
        let (client, server_name) = build_client_config(config, rustls::DEFAULT_VERSIONS)?;
        let peer: Option<SocketAddr> = conn.remote_addr();
        debug!(?peer, sni = %config.server_name, "tls handshake");
        let connector = TlsConnector::from(Arc::new(client));

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::interrupted(Operation::TlsHandshake)),
            res = tokio::time::timeout(self.timeout, connector.connect(server_name, conn)) => match res {
                Err(_) => return Err(NetError::timeout(Operation::TlsHandshake)),
                Ok(Err(e)) => return Err(NetError::from_io(e, Operation::TlsHandshake)),
                Ok(Ok(stream)) => stream,
            },
        };

        let (_, session) = stream.get_ref();
        let state = TlsConnectionState {
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|cs| format!("{:?}", cs.suite()))
                .unwrap_or_default(),
            tls_version: tls_version_string(session.protocol_version()),
            negotiated_protocol: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
            peer_certificates: session
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default(),
        };
        Ok((Box::new(stream), state))
    }
}
