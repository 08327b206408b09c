//! Measurement traces.
//!
//! A [`Trace`] collects archival records as a side effect of ordinary network
//! calls. Each category of record has its own bounded queue; enqueueing never
//! blocks and drops the record when the queue is full, so a slow consumer can
//! never stall a measurement. Callers drain the queues after each step.
//!
//! ```text
//!   DialerTrace ─────────► tcp_connects   (8)
//!       └─ TracedConn ───► network_events (64)
//!   TlsHandshakerTrace ──► network_events, tls_handshakes (8)
//!   QuicDialerTrace ─────► network_events, tls_handshakes
//! ```

mod conn;
mod dialer;
mod tls;

pub use conn::TracedConn;
pub use dialer::DialerTrace;
pub use tls::{QuicDialerTrace, TlsHandshakerTrace};

use crate::error::{NetError, new_failure};
use crate::model::{
    ArchivalBinaryData, ArchivalNetworkEvent, ArchivalTcpConnectResult, ArchivalTcpConnectStatus,
    ArchivalTlsOrQuicHandshakeResult,
};
use crate::netx::{Dialer, QuicDialer, TlsConfig, TlsConnectionState, TlsHandshaker, split_host_port};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Capacity of the network events queue.
pub const NETWORK_EVENT_BUFFER_SIZE: usize = 64;

/// Capacity of the TCP connect queue.
pub const TCP_CONNECT_BUFFER_SIZE: usize = 8;

/// Capacity of the TLS/QUIC handshake queue.
pub const TLS_HANDSHAKE_BUFFER_SIZE: usize = 8;

/// Fixed-capacity queue with drop-on-full enqueue and non-blocking drain.
#[derive(Debug)]
struct EventQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> EventQueue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn push(&self, event: T, category: &'static str) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!(category, "trace buffer full, dropping event"),
            Err(TrySendError::Closed(_)) => warn!(category, "BUG: trace queue closed"),
        }
    }

    fn drain(&self) -> Vec<T> {
        let Ok(mut rx) = self.rx.lock() else {
            warn!("BUG: trace queue lock poisoned");
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Collects the archival records of one measurement step.
#[derive(Debug)]
pub struct Trace {
    index: i64,
    zero_time: Instant,
    network_events: EventQueue<ArchivalNetworkEvent>,
    tcp_connects: EventQueue<ArchivalTcpConnectResult>,
    tls_handshakes: EventQueue<ArchivalTlsOrQuicHandshakeResult>,
}

impl Trace {
    /// Create a trace with the default queue capacities.
    #[must_use]
    pub fn new(index: i64, zero_time: Instant) -> Arc<Self> {
        Self::with_capacities(
            index,
            zero_time,
            NETWORK_EVENT_BUFFER_SIZE,
            TCP_CONNECT_BUFFER_SIZE,
            TLS_HANDSHAKE_BUFFER_SIZE,
        )
    }

    /// Create a trace with explicit queue capacities. A zero capacity is
    /// raised to one.
    #[must_use]
    pub fn with_capacities(
        index: i64,
        zero_time: Instant,
        network_events: usize,
        tcp_connects: usize,
        tls_handshakes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            zero_time,
            network_events: EventQueue::new(network_events),
            tcp_connects: EventQueue::new(tcp_connects),
            tls_handshakes: EventQueue::new(tls_handshakes),
        })
    }

    /// Wrap a dialer so that TCP connects and I/O are recorded here.
    #[must_use]
    pub fn new_dialer_without_resolver(self: &Arc<Self>, dialer: Arc<dyn Dialer>) -> DialerTrace {
        DialerTrace::new(dialer, Arc::clone(self))
    }

    /// Wrap a TLS handshaker so that handshakes are recorded here.
    #[must_use]
    pub fn new_tls_handshaker(
        self: &Arc<Self>,
        handshaker: Arc<dyn TlsHandshaker>,
    ) -> TlsHandshakerTrace {
        TlsHandshakerTrace::new(handshaker, Arc::clone(self))
    }

    /// Wrap a QUIC dialer so that handshakes are recorded here.
    #[must_use]
    pub fn new_quic_dialer(self: &Arc<Self>, dialer: Arc<dyn QuicDialer>) -> QuicDialerTrace {
        QuicDialerTrace::new(dialer, Arc::clone(self))
    }

    /// Record the end of a connect attempt. Only TCP networks are recorded.
    pub fn on_connect_done(
        &self,
        started: Instant,
        network: &str,
        remote_addr: &str,
        err: Option<&NetError>,
        finished: Instant,
    ) {
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                trace!(
                    index = self.index,
                    t0 = seconds_since(self.zero_time, started),
                    %remote_addr,
                    "tcp connect done"
                );
                let record = new_archival_tcp_connect_result(
                    remote_addr,
                    err,
                    seconds_since(self.zero_time, finished),
                );
                self.tcp_connects.push(record, "tcp_connect");
            }
            // UDP "connects" cannot fail.
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_network_event(
        &self,
        operation: &str,
        proto: Option<&str>,
        address: Option<&str>,
        num_bytes: Option<usize>,
        err: Option<&NetError>,
        started: Instant,
        finished: Instant,
    ) {
        let event = ArchivalNetworkEvent {
            address: address.map(str::to_string),
            failure: new_failure(err),
            num_bytes: num_bytes.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            operation: operation.to_string(),
            proto: proto.map(str::to_string),
            t0: seconds_since(self.zero_time, started),
            t: seconds_since(self.zero_time, finished),
            tags: Vec::new(),
            transaction_id: self.index,
        };
        self.network_events.push(event, "network_event");
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_handshake_done(
        &self,
        network: &str,
        address: &str,
        config: &TlsConfig,
        state: Option<&TlsConnectionState>,
        err: Option<&NetError>,
        started: Instant,
        finished: Instant,
    ) {
        let record = new_archival_tls_or_quic_handshake_result(
            self.index,
            network,
            address,
            config,
            state,
            err,
            seconds_since(self.zero_time, started),
            seconds_since(self.zero_time, finished),
        );
        self.tls_handshakes.push(record, "tls_handshake");
    }

    /// Take every buffered network event, oldest first.
    #[must_use]
    pub fn drain_network_events(&self) -> Vec<ArchivalNetworkEvent> {
        self.network_events.drain()
    }

    /// Take every buffered TCP connect result, oldest first.
    #[must_use]
    pub fn drain_tcp_connects(&self) -> Vec<ArchivalTcpConnectResult> {
        self.tcp_connects.drain()
    }

    /// Take every buffered TLS or QUIC handshake result, oldest first.
    #[must_use]
    pub fn drain_tls_handshakes(&self) -> Vec<ArchivalTlsOrQuicHandshakeResult> {
        self.tls_handshakes.drain()
    }
}

/// Build the archival record of a TCP connect attempt.
#[must_use]
pub fn new_archival_tcp_connect_result(
    address: &str,
    err: Option<&NetError>,
    finished: f64,
) -> ArchivalTcpConnectResult {
    let (ip, port) = archival_split_host_port(address);
    ArchivalTcpConnectResult {
        ip,
        port: archival_port(&port).to_string(),
        status: ArchivalTcpConnectStatus {
            blocked: None,
            failure: new_failure(err),
            success: err.is_none(),
        },
        t: finished,
    }
}

/// Build the archival record of a TLS (`tcp`) or QUIC (`udp`) handshake.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn new_archival_tls_or_quic_handshake_result(
    index: i64,
    network: &str,
    address: &str,
    config: &TlsConfig,
    state: Option<&TlsConnectionState>,
    err: Option<&NetError>,
    started: f64,
    finished: f64,
) -> ArchivalTlsOrQuicHandshakeResult {
    let state = state.cloned().unwrap_or_default();
    ArchivalTlsOrQuicHandshakeResult {
        network: network.to_string(),
        address: address.to_string(),
        cipher_suite: state.cipher_suite,
        failure: new_failure(err),
        negotiated_protocol: state.negotiated_protocol,
        no_tls_verify: config.insecure_skip_verify,
        peer_certificates: state
            .peer_certificates
            .iter()
            .map(|der| ArchivalBinaryData::new(der))
            .collect(),
        server_name: config.server_name.clone(),
        t0: started,
        t: finished,
        tags: Vec::new(),
        tls_version: state.tls_version,
        transaction_id: index,
    }
}

/// Like [`split_host_port`] but logs and returns empty strings on error.
#[must_use]
pub fn archival_split_host_port(endpoint: &str) -> (String, String) {
    match split_host_port(endpoint) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%endpoint, error = %e, "BUG: archival_split_host_port: invalid endpoint");
            (String::new(), String::new())
        }
    }
}

/// Parse a port, logging and returning zero when it is not a valid port.
#[must_use]
pub fn archival_port(port: &str) -> u16 {
    port.parse().unwrap_or_else(|_| {
        warn!(%port, "BUG: archival_port: invalid port");
        0
    })
}

/// Seconds elapsed between `zero_time` and `t`; zero (with a log line) if
/// `t` precedes `zero_time`.
#[must_use]
pub fn seconds_since(zero_time: Instant, t: Instant) -> f64 {
    match t.checked_duration_since(zero_time) {
        Some(d) => d.as_secs_f64(),
        None => {
            warn!("BUG: seconds_since: instant precedes zero time");
            0.0
        }
    }
}
