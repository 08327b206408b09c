use super::{TaskEmitter, TaskRequest, TaskRunner};
use crate::config::{DialConfig, EngineConfig};
use crate::control::{ControlRequest, WEB_CONNECTIVITY_HELPER, control, discover_h3_server, find_test_helper};
use crate::enginenetx::Network;
use crate::kvstore::MemoryKeyValueStore;
use crate::model::Service;
use crate::netx::{AsnDatabase, AsnLookup, ByteCounter, HttpTransport, SystemResolver};
use crate::session::ExperimentSession;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlTaskRequest {
    /// Test helper to use. When absent, the first `https` web
    /// connectivity helper in `test_helpers` is used.
    #[serde(default)]
    pub th_url: Option<String>,
    #[serde(default)]
    pub test_helpers: Vec<Service>,
    /// Optional `prefix,asn,org` CSV for ASN enrichment.
    #[serde(default)]
    pub asn_database: Option<PathBuf>,
    pub request: ControlRequest,
}

/// Session assembled from the task arguments. Dialer statistics live in
/// memory and die with the task.
struct TaskSession {
    network: Network,
    helpers: Vec<Service>,
    asn: AsnDatabase,
}

impl ExperimentSession for TaskSession {
    fn default_http_transport(&self) -> Arc<dyn HttpTransport> {
        self.network.http_transport()
    }

    fn http_timeout(&self) -> Option<Duration> {
        Some(EngineConfig::default().control_timeout)
    }

    fn test_helpers_by_name(&self, name: &str) -> Option<Vec<Service>> {
        (name == WEB_CONNECTIVITY_HELPER && !self.helpers.is_empty()).then(|| self.helpers.clone())
    }

    fn asn_lookup(&self) -> &dyn AsnLookup {
        &self.asn
    }
}

/// Queries a test helper.
///
/// Emits `Control` with the decoded response, the ASNs of the DNS addresses
/// and whether the target seems to speak HTTP/3, or `Failure` on error.
pub struct ControlRunner;

#[async_trait]
impl TaskRunner for ControlRunner {
    async fn run(&self, cancel: CancellationToken, emitter: &dyn TaskEmitter, request: TaskRequest) {
        let name = request.task_name();
        let TaskRequest::Control(args) = request else {
            warn!(task = name, "BUG: ControlRunner got the wrong request");
            return;
        };
        let asn = match &args.asn_database {
            Some(path) => AsnDatabase::load(path).unwrap_or_else(|e| {
                emitter.log("warning", &format!("cannot load ASN database: {e}"));
                AsnDatabase::empty()
            }),
            None => AsnDatabase::empty(),
        };
        let network = Network::new(
            Arc::new(ByteCounter::new()),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(SystemResolver::new()),
            &DialConfig::default(),
        );
        let session = TaskSession {
            network,
            helpers: args.test_helpers,
            asn,
        };
        let th_url = match args
            .th_url
            .or_else(|| find_test_helper(&session).map(|th| th.address))
        {
            Some(url) => url,
            None => {
                emitter.maybe_emit_event(
                    "Failure",
                    serde_json::json!({"failure": "no test helper available"}),
                );
                return;
            }
        };

        let result = control(&cancel, &session, &th_url, &args.request).await;
        if let Err(e) = session.network.close() {
            warn!(error = %e, "closing task network");
        }
        match result {
            Ok(resp) => {
                let h3 = Url::parse(&args.request.http_request)
                    .is_ok_and(|url| discover_h3_server(&resp.http_request, &url));
                emitter.maybe_emit_event(
                    "Control",
                    serde_json::json!({
                        "th_url": th_url,
                        "response": resp,
                        "asns": resp.dns.asns,
                        "h3": h3,
                    }),
                );
            }
            Err(e) => emitter.maybe_emit_event(
                "Failure",
                serde_json::json!({"failure": e.failure(), "operation": e.operation().as_str()}),
            ),
        }
    }
}
