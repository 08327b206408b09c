use super::{TaskEmitter, TaskRequest, TaskRunner};
use crate::netx::{Dialer, TcpDialer};
use crate::trace::Trace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectRequest {
    /// `ip:port` endpoint to connect to.
    pub address: String,
}

/// Connects to one endpoint and reports the archival TCP connect result.
///
/// Emits `TcpConnect` with the list of connect results.
pub struct TcpConnectRunner;

#[async_trait]
impl TaskRunner for TcpConnectRunner {
    async fn run(&self, cancel: CancellationToken, emitter: &dyn TaskEmitter, request: TaskRequest) {
        let name = request.task_name();
        let TaskRequest::TcpConnect(args) = request else {
            warn!(task = name, "BUG: TcpConnectRunner got the wrong request");
            return;
        };
        let trace = Trace::new(0, Instant::now());
        let dialer = trace.new_dialer_without_resolver(Arc::new(TcpDialer::default()));
        emitter.log("info", &format!("tcp connect {}", args.address));
        match dialer.dial(&cancel, "tcp", &args.address).await {
            Ok(conn) => drop(conn),
            Err(e) => emitter.log("warning", &format!("tcp connect failed: {e}")),
        }
        match serde_json::to_value(trace.drain_tcp_connects()) {
            Ok(value) => emitter.maybe_emit_event("TcpConnect", value),
            Err(e) => warn!(error = %e, "cannot serialize tcp connect results"),
        }
    }
}
