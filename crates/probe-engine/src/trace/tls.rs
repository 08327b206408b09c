use super::Trace;
use crate::error::NetError;
use crate::netx::{BoxedConn, QuicConnection, QuicDialer, TlsConfig, TlsConnectionState, TlsHandshaker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// TLS handshaker that records handshake boundaries and results.
pub struct TlsHandshakerTrace {
    inner: Arc<dyn TlsHandshaker>,
    trace: Arc<Trace>,
}

impl TlsHandshakerTrace {
    pub(super) fn new(inner: Arc<dyn TlsHandshaker>, trace: Arc<Trace>) -> Self {
        Self { inner, trace }
    }
}

#[async_trait]
impl TlsHandshaker for TlsHandshakerTrace {
    async fn handshake(
        &self,
        cancel: &CancellationToken,
        conn: BoxedConn,
        config: &TlsConfig,
    ) -> Result<(BoxedConn, TlsConnectionState), NetError> {
        let address = conn
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let started = Instant::now();
        self.trace.on_network_event(
            "tls_handshake_start",
            None,
            None,
            None,
            None,
            started,
            started,
        );
        let res = self.inner.handshake(cancel, conn, config).await;
        let finished = Instant::now();
        let (state, err) = match &res {
            Ok((_, state)) => (Some(state), None),
            Err(e) => (None, Some(e)),
        };
        self.trace.on_network_event(
            "tls_handshake_done",
            None,
            None,
            None,
            None,
            finished,
            finished,
        );
        self.trace
            .on_handshake_done("tcp", &address, config, state, err, started, finished);
        res
    }
}

/// QUIC dialer that records handshake boundaries and results.
pub struct QuicDialerTrace {
    inner: Arc<dyn QuicDialer>,
    trace: Arc<Trace>,
}

impl QuicDialerTrace {
    pub(super) fn new(inner: Arc<dyn QuicDialer>, trace: Arc<Trace>) -> Self {
        Self { inner, trace }
    }
}

#[async_trait]
impl QuicDialer for QuicDialerTrace {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        address: &str,
        config: &TlsConfig,
    ) -> Result<QuicConnection, NetError> {
        let started = Instant::now();
        self.trace.on_network_event(
            "quic_handshake_start",
            None,
            None,
            None,
            None,
            started,
            started,
        );
        let res = self.inner.dial(cancel, address, config).await;
        let finished = Instant::now();
        let (state, err) = match &res {
            Ok(conn) => (Some(&conn.state), None),
            Err(e) => (None, Some(e)),
        };
        self.trace.on_network_event(
            "quic_handshake_done",
            None,
            None,
            None,
            None,
            finished,
            finished,
        );
        self.trace
            .on_handshake_done("udp", address, config, state, err, started, finished);
        res
    }
}
