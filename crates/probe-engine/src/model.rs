//! Archival data model.
//!
//! Archival records are the serialized form of what happened during a
//! measurement. They are produced exactly once per sub-operation and never
//! mutated afterwards. Timestamps are seconds relative to the zero time of
//! the [`Trace`](crate::trace::Trace) that produced them.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Status of a TCP connect attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalTcpConnectStatus {
    /// Always `null` in records produced by this engine.
    pub blocked: Option<bool>,
    pub failure: Option<String>,
    pub success: bool,
}

/// Result of a TCP connect attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalTcpConnectResult {
    pub ip: String,
    pub port: String,
    pub status: ArchivalTcpConnectStatus,
    pub t: f64,
}

/// Binary data as stored in archival records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalBinaryData {
    pub data: String,
    pub format: String,
}

impl ArchivalBinaryData {
    #[must_use]
    pub fn new(raw: &[u8]) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(raw),
            format: "base64".to_string(),
        }
    }
}

/// Result of a TLS or QUIC handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalTlsOrQuicHandshakeResult {
    /// `tcp` for TLS, `udp` for QUIC.
    pub network: String,
    pub address: String,
    pub cipher_suite: String,
    pub failure: Option<String>,
    pub negotiated_protocol: String,
    pub no_tls_verify: bool,
    pub peer_certificates: Vec<ArchivalBinaryData>,
    pub server_name: String,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tls_version: String,
    pub transaction_id: i64,
}

/// A low-level network event (I/O or handshake boundary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalNetworkEvent {
    pub address: Option<String>,
    pub failure: Option<String>,
    pub num_bytes: Option<i64>,
    pub operation: String,
    pub proto: Option<String>,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub transaction_id: i64,
}

/// A backend service, e.g. a test helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<String>,
}
