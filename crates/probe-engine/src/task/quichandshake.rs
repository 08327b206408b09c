use super::{TaskEmitter, TaskRequest, TaskRunner};
use crate::config::DialConfig;
use crate::netx::{QuicDialer, QuinnQuicDialer, TlsConfig};
use crate::trace::Trace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuicHandshakeRequest {
    /// `ip:port` endpoint to handshake with.
    pub address: String,
    /// SNI to send; empty disables SNI.
    #[serde(default)]
    pub sni: String,
    /// ALPN protocols to offer. Defaults to `h3`.
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Handshake timeout; the engine default when absent.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl QuicHandshakeRequest {
    fn tls_config(&self) -> TlsConfig {
        let mut config = TlsConfig::new(self.sni.clone());
        config.alpn = if self.alpn.is_empty() {
            vec!["h3".to_string()]
        } else {
            self.alpn.clone()
        };
        config.insecure_skip_verify = self.insecure_skip_verify;
        config
    }
}

/// Performs one QUIC handshake and reports the archival results.
///
/// Emits `QuicHandshake` with the handshake records and the network events
/// around them.
pub struct QuicHandshakeRunner;

#[async_trait]
impl TaskRunner for QuicHandshakeRunner {
    async fn run(&self, cancel: CancellationToken, emitter: &dyn TaskEmitter, request: TaskRequest) {
        let name = request.task_name();
        let TaskRequest::QuicHandshake(args) = request else {
            warn!(task = name, "BUG: QuicHandshakeRunner got the wrong request");
            return;
        };
        let timeout = args
            .timeout
            .unwrap_or_else(|| DialConfig::default().quic_handshake_timeout);
        let trace = Trace::new(0, Instant::now());
        let dialer = trace.new_quic_dialer(Arc::new(QuinnQuicDialer::new(timeout)));
        emitter.log("info", &format!("quic handshake {} sni={}", args.address, args.sni));
        match dialer.dial(&cancel, &args.address, &args.tls_config()).await {
            Ok(conn) => {
                debug!(alpn = %conn.state.negotiated_protocol, "quic handshake done");
                conn.close().await;
            }
            Err(e) => emitter.log("warning", &format!("quic handshake failed: {e}")),
        }
        emitter.maybe_emit_event(
            "QuicHandshake",
            serde_json::json!({
                "handshakes": trace.drain_tls_handshakes(),
                "network_events": trace.drain_network_events(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskHandle;

    #[test]
    fn test_request_defaults() {
        let request: QuicHandshakeRequest =
            serde_json::from_str(r#"{"address": "192.0.2.1:443", "timeout": "2s"}"#).unwrap();
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
        let config = request.tls_config();
        assert_eq!(config.alpn, ["h3"]);
        assert!(config.server_name.is_empty());
        assert!(!config.insecure_skip_verify);
    }

    #[tokio::test]
    async fn test_silent_endpoint_reports_failed_handshake() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        drop(socket);

        let handle = TaskHandle::spawn(
            Arc::new(QuicHandshakeRunner),
            TaskRequest::QuicHandshake(QuicHandshakeRequest {
                address: addr.to_string(),
                sni: "example.com".to_string(),
                timeout: Some(Duration::from_millis(200)),
                ..QuicHandshakeRequest::default()
            }),
        );

        let mut result = None;
        while let Some(ev) = handle.wait_for_next_event(Some(Duration::from_secs(10))).await {
            if ev.key == "QuicHandshake" {
                result = Some(ev.value);
            }
        }
        assert!(handle.is_done());
        let result = result.unwrap();
        let handshake = &result["handshakes"][0];
        assert_eq!(handshake["network"], "udp");
        assert_eq!(handshake["server_name"], "example.com");
        assert!(handshake["failure"].is_string());
        let operations: Vec<&str> = result["network_events"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|ev| ev["operation"].as_str())
            .collect();
        assert_eq!(operations, ["quic_handshake_start", "quic_handshake_done"]);
    }
}
