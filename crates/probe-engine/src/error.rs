//! Failure taxonomy.
//!
//! Every network error that reaches an archival record is classified into a
//! stable failure string (e.g. `connection_refused`) and tagged with the
//! [`Operation`] that failed. Downstream code compares failure strings, never
//! error messages, so the strings here are part of the data format.

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Classified reason for a failed network operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    GenericTimeout,
    /// The operation was cancelled through its cancellation token.
    Interrupted,
    Eof,
    HostUnreachable,
    NetworkUnreachable,
    DnsNxdomain,
    DnsNoAnswer,
    SslInvalidHostname,
    SslUnknownAuthority,
    SslInvalidCertificate,
    SslFailedHandshake,
    HttpRequestFailed,
    JsonParse,
    /// Anything we cannot map; carries a short description.
    Unknown(String),
}

impl FailureKind {
    /// The failure string written into archival records.
    #[must_use]
    pub fn as_failure_string(&self) -> String {
        match self {
            Self::ConnectionRefused => "connection_refused".to_string(),
            Self::ConnectionReset => "connection_reset".to_string(),
            Self::ConnectionAborted => "connection_aborted".to_string(),
            Self::GenericTimeout => "generic_timeout_error".to_string(),
            Self::Interrupted => "interrupted".to_string(),
            Self::Eof => "eof_error".to_string(),
            Self::HostUnreachable => "host_unreachable".to_string(),
            Self::NetworkUnreachable => "network_unreachable".to_string(),
            Self::DnsNxdomain => "dns_nxdomain_error".to_string(),
            Self::DnsNoAnswer => "dns_no_answer".to_string(),
            Self::SslInvalidHostname => "ssl_invalid_hostname".to_string(),
            Self::SslUnknownAuthority => "ssl_unknown_authority".to_string(),
            Self::SslInvalidCertificate => "ssl_invalid_certificate".to_string(),
            Self::SslFailedHandshake => "ssl_failed_handshake".to_string(),
            Self::HttpRequestFailed => "http_request_failed".to_string(),
            Self::JsonParse => "json_parse_error".to_string(),
            Self::Unknown(detail) => format!("unknown_failure: {detail}"),
        }
    }

    /// Classify an I/O error by its kind.
    #[must_use]
    pub fn from_io_error(err: &io::Error) -> Self {
        if let Some(inner) = err.get_ref() {
            if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
                return Self::from_tls_error(tls);
            }
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::TimedOut => Self::GenericTimeout,
            io::ErrorKind::UnexpectedEof => Self::Eof,
            io::ErrorKind::HostUnreachable => Self::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            io::ErrorKind::Interrupted => Self::Interrupted,
            _ => Self::Unknown(err.to_string()),
        }
    }

    /// Classify a rustls handshake error.
    #[must_use]
    pub fn from_tls_error(err: &rustls::Error) -> Self {
        use rustls::CertificateError;
        match err {
            rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => {
                Self::SslInvalidHostname
            }
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
                Self::SslUnknownAuthority
            }
            rustls::Error::InvalidCertificate(_) => Self::SslInvalidCertificate,
            _ => Self::SslFailedHandshake,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_failure_string())
    }
}

/// The operation during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    TlsHandshake,
    QuicHandshake,
    Read,
    Write,
    Resolve,
    HttpRoundTrip,
    /// Failure of a whole high-level operation, e.g. the control channel.
    TopLevel,
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::TlsHandshake => "tls_handshake",
            Self::QuicHandshake => "quic_handshake",
            Self::Read => "read",
            Self::Write => "write",
            Self::Resolve => "resolve",
            Self::HttpRoundTrip => "http_round_trip",
            Self::TopLevel => "top_level",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified network failure.
///
/// Cloneable so that the same failure can be stored in an archival record,
/// tallied by the stats manager and returned to the caller.
#[derive(Debug, Clone, Error)]
#[error("{operation}: {kind}")]
pub struct NetError {
    kind: FailureKind,
    operation: Operation,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl NetError {
    #[must_use]
    pub fn new(kind: FailureKind, operation: Operation) -> Self {
        Self {
            kind,
            operation,
            source: None,
        }
    }

    /// Build from an I/O error, classifying it.
    #[must_use]
    pub fn from_io(err: io::Error, operation: Operation) -> Self {
        Self {
            kind: FailureKind::from_io_error(&err),
            operation,
            source: Some(Arc::new(err)),
        }
    }

    /// Attach the underlying error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    #[must_use]
    pub fn interrupted(operation: Operation) -> Self {
        Self::new(FailureKind::Interrupted, operation)
    }

    #[must_use]
    pub fn timeout(operation: Operation) -> Self {
        Self::new(FailureKind::GenericTimeout, operation)
    }

    #[must_use]
    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The failure string used in archival records.
    #[must_use]
    pub fn failure(&self) -> String {
        self.kind.as_failure_string()
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.kind == FailureKind::Interrupted
    }
}

/// Failure string for an optional error, `None` meaning success.
#[must_use]
pub fn new_failure(err: Option<&NetError>) -> Option<String> {
    err.map(NetError::failure)
}
