//! Control protocol.
//!
//! The engine describes what it is about to measure (URL, headers, TCP and
//! QUIC endpoints) to a test helper, which performs the same operations from
//! an uncensored vantage point and reports its view back.

use crate::error::{NetError, Operation};
use crate::httpx::HttpxClient;
use crate::model::Service;
use crate::netx::AsnLookup;
use crate::session::ExperimentSession;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Name under which web connectivity test helpers are declared.
pub const WEB_CONNECTIVITY_HELPER: &str = "web-connectivity";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub http_request: String,
    pub http_request_headers: BTreeMap<String, Vec<String>>,
    /// `ip:port` endpoints for the helper to connect to.
    pub tcp_connect: Vec<String>,
    /// `ip:port` endpoints for the helper to QUIC-handshake with.
    pub quic_handshake: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlTcpConnectResult {
    pub status: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlQuicHandshakeResult {
    pub status: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlHttpRequestResult {
    pub body_length: i64,
    pub failure: Option<String>,
    pub title: String,
    pub headers: BTreeMap<String, String>,
    pub status_code: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlHttp3RequestResult {
    pub failure: Option<String>,
    pub status_code: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlDnsResult {
    pub failure: Option<String>,
    pub addrs: Vec<String>,
    /// ASN of each entry in `addrs`, filled locally by [`Self::fill_asns`].
    #[serde(skip)]
    pub asns: Vec<i64>,
}

impl ControlDnsResult {
    /// Look up the ASN of every address, using 0 when unknown.
    pub fn fill_asns(&mut self, lookup: &dyn AsnLookup) {
        self.asns = self
            .addrs
            .iter()
            .map(|ip| match lookup.lookup_asn(ip) {
                Ok((asn, _org)) => i64::from(asn),
                Err(e) => {
                    debug!(%ip, error = %e, "ASN lookup failed");
                    0
                }
            })
            .collect();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlResponse {
    pub dns: ControlDnsResult,
    pub http_request: ControlHttpRequestResult,
    pub http3_request: ControlHttp3RequestResult,
    pub quic_handshake: BTreeMap<String, ControlQuicHandshakeResult>,
    pub tcp_connect: BTreeMap<String, ControlTcpConnectResult>,
}

/// Send `request` to the helper at `th_url` and return its view.
///
/// Any failure is reported as a `top_level` failure.
pub async fn control(
    cancel: &CancellationToken,
    session: &dyn ExperimentSession,
    th_url: &str,
    request: &ControlRequest,
) -> Result<ControlResponse, NetError> {
    let mut client =
        HttpxClient::new(th_url, session.default_http_transport(), session.user_agent());
    if let Some(timeout) = session.http_timeout() {
        client = client.with_timeout(timeout);
    }
    info!(%th_url, target = %request.http_request, "control request");
    let mut response: ControlResponse = client
        .post_json(cancel, "/", request)
        .await
        .map_err(|e| e.into_net_error(Operation::TopLevel))?;
    response.dns.fill_asns(session.asn_lookup());
    debug!(
        addrs = response.dns.addrs.len(),
        tcp_connect = response.tcp_connect.len(),
        "control response"
    );
    Ok(response)
}

/// The first web connectivity helper reachable over `https`.
#[must_use]
pub fn find_test_helper(session: &dyn ExperimentSession) -> Option<Service> {
    session
        .test_helpers_by_name(WEB_CONNECTIVITY_HELPER)?
        .into_iter()
        .find(|th| th.kind == "https")
}

/// Whether the control's response advertises HTTP/3 through `Alt-Svc`.
///
/// Only meaningful for `https` targets. The header value is split on `;`
/// and any segment mentioning `h3` counts, so `h3-29` matches too.
#[must_use]
pub fn discover_h3_server(resp: &ControlHttpRequestResult, url: &Url) -> bool {
    if url.scheme() != "https" {
        return false;
    }
    resp.headers
        .get("Alt-Svc")
        .is_some_and(|alt_svc| alt_svc.split(';').any(|entry| entry.contains("h3")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginenetx::{HttpsDialer, HttpsDialerStatsManager, NullPolicy};
    use crate::kvstore::MemoryKeyValueStore;
    use crate::netx::{
        AsnDatabase, AsnError, BoxedConn, ByteCounter, ByteCountingTransport, Dialer,
        EngineHttpTransport, HttpTransport, SystemResolver, TcpDialer, TlsConfig,
        TlsConnectionState, TlsHandshaker,
    };
    use async_trait::async_trait;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Returns the TCP stream untouched, so `https` helper URLs reach a
    /// cleartext test server through the HTTPS dialer.
    struct PassthroughHandshaker;

    #[async_trait]
    impl TlsHandshaker for PassthroughHandshaker {
        async fn handshake(
            &self,
            _cancel: &CancellationToken,
            conn: BoxedConn,
            _config: &TlsConfig,
        ) -> Result<(BoxedConn, TlsConnectionState), NetError> {
            Ok((conn, TlsConnectionState::default()))
        }
    }

    struct FakeSession {
        helpers: Option<Vec<Service>>,
        asn: AsnDatabase,
        counter: Arc<ByteCounter>,
        stats: Arc<HttpsDialerStatsManager>,
        transport: Arc<dyn HttpTransport>,
    }

    impl FakeSession {
        fn new() -> Self {
            let counter = Arc::new(ByteCounter::new());
            let stats = Arc::new(HttpsDialerStatsManager::new(Arc::new(
                MemoryKeyValueStore::new(),
            )));
            let tcp: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
            let https = HttpsDialer::new(
                Arc::clone(&tcp),
                Arc::new(PassthroughHandshaker),
                Arc::new(NullPolicy::new(Arc::new(SystemResolver::new()))),
                Arc::clone(&stats),
            );
            let txp: Arc<dyn HttpTransport> =
                Arc::new(EngineHttpTransport::new(tcp, Arc::new(https)));
            Self {
                helpers: None,
                asn: AsnDatabase::parse("8.8.8.0/24,15169,Google LLC\n").unwrap(),
                transport: Arc::new(ByteCountingTransport::new(txp, Arc::clone(&counter))),
                counter,
                stats,
            }
        }
    }

    impl ExperimentSession for FakeSession {
        fn default_http_transport(&self) -> Arc<dyn HttpTransport> {
            Arc::clone(&self.transport)
        }

        fn test_helpers_by_name(&self, _name: &str) -> Option<Vec<Service>> {
            self.helpers.clone()
        }

        fn asn_lookup(&self) -> &dyn AsnLookup {
            &self.asn
        }
    }

    struct FlakyLookup;

    impl AsnLookup for FlakyLookup {
        fn lookup_asn(&self, ip: &str) -> Result<(u32, String), AsnError> {
            match ip {
                "1.1.1.1" => Ok((13335, "Cloudflare".to_string())),
                _ => Err(AsnError::NotFound(ip.to_string())),
            }
        }
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_fill_asns_keeps_length_and_order() {
        let cases: [&[&str]; 4] = [
            &[],
            &["1.1.1.1"],
            &["9.9.9.9", "1.1.1.1", "not-an-ip"],
            &["1.1.1.1", "1.1.1.1", "2001:db8::1", "8.8.8.8"],
        ];
        for addrs in cases {
            let mut dns = ControlDnsResult {
                addrs: addrs.iter().map(|s| (*s).to_string()).collect(),
                ..ControlDnsResult::default()
            };
            dns.fill_asns(&FlakyLookup);
            assert_eq!(dns.asns.len(), addrs.len());
            for (addr, asn) in addrs.iter().zip(&dns.asns) {
                let expected = if *addr == "1.1.1.1" { 13335 } else { 0 };
                assert_eq!(*asn, expected);
            }
        }
    }

    #[test]
    fn test_asns_never_on_the_wire() {
        let dns = ControlDnsResult {
            failure: None,
            addrs: vec!["8.8.8.8".to_string()],
            asns: vec![15169],
        };
        let value = serde_json::to_value(&dns).unwrap();
        assert!(value.get("asns").is_none());

        let decoded: ControlDnsResult =
            serde_json::from_str(r#"{"failure": null, "addrs": ["8.8.8.8"], "asns": [1]}"#)
                .unwrap();
        assert!(decoded.asns.is_empty());
    }

    #[test]
    fn test_discover_h3_server() {
        let mut resp = ControlHttpRequestResult::default();
        let https = Url::parse("https://example.com/").unwrap();
        let http = Url::parse("http://example.com/").unwrap();
        assert!(!discover_h3_server(&resp, &https));

        resp.headers
            .insert("Alt-Svc".to_string(), r#"h3=":443"; ma=2592000"#.to_string());
        assert!(discover_h3_server(&resp, &https));
        assert!(!discover_h3_server(&resp, &http));

        resp.headers
            .insert("Alt-Svc".to_string(), r#"h2=":443"; ma=2592000"#.to_string());
        assert!(!discover_h3_server(&resp, &https));
    }

    #[test]
    fn test_find_test_helper() {
        let mut session = FakeSession::new();
        assert!(find_test_helper(&session).is_none());

        session.helpers = Some(vec![
            Service {
                address: "https://d33d1gs9kpq1c5.cloudfront.net".to_string(),
                kind: "cloudfront".to_string(),
                front: Some("d33d1gs9kpq1c5.cloudfront.net".to_string()),
            },
            Service {
                address: "https://th.example.org".to_string(),
                kind: "https".to_string(),
                front: None,
            },
        ]);
        let th = find_test_helper(&session).unwrap();
        assert_eq!(th.address, "https://th.example.org");

        session.helpers = Some(vec![Service {
            address: "http://th.example.org".to_string(),
            kind: "http".to_string(),
            front: None,
        }]);
        assert!(find_test_helper(&session).is_none());
    }

    fn helper_app() -> Router {
        Router::new().route(
            "/",
            post(|Json(req): Json<ControlRequest>| async move {
                let tcp_connect: serde_json::Map<String, serde_json::Value> = req
                    .tcp_connect
                    .iter()
                    .map(|ep| (ep.clone(), serde_json::json!({"status": true, "failure": null})))
                    .collect();
                Json(serde_json::json!({
                    "dns": {"failure": null, "addrs": ["8.8.8.8", "192.0.2.1"]},
                    "http_request": {
                        "body_length": 1024,
                        "failure": null,
                        "title": "Example",
                        "headers": {"Alt-Svc": "h3=\":443\""},
                        "status_code": 200
                    },
                    "http3_request": {"failure": null, "status_code": 200},
                    "quic_handshake": {},
                    "tcp_connect": tcp_connect,
                }))
            }),
        )
    }

    #[tokio::test]
    async fn test_control_round_trip_fills_asns() {
        let app = helper_app();
        let th_url = serve(app).await;
        let request = ControlRequest {
            http_request: "https://example.com/".to_string(),
            tcp_connect: vec!["93.184.216.34:443".to_string()],
            ..ControlRequest::default()
        };
        let resp = control(&CancellationToken::new(), &FakeSession::new(), &th_url, &request)
            .await
            .unwrap();
        assert_eq!(resp.dns.asns, vec![15169, 0]);
        assert_eq!(resp.http_request.status_code, 200);
        assert!(resp.tcp_connect["93.184.216.34:443"].status);
        assert!(discover_h3_server(
            &resp.http_request,
            &Url::parse(&request.http_request).unwrap()
        ));
    }

    #[tokio::test]
    async fn test_control_failures_are_top_level() {
        let app = Router::new().route("/", post(|| async { StatusCode::BAD_GATEWAY }));
        let th_url = serve(app).await;
        let err = control(
            &CancellationToken::new(),
            &FakeSession::new(),
            &th_url,
            &ControlRequest::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.operation(), Operation::TopLevel);
        assert_eq!(err.failure(), "http_request_failed");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = control(&cancel, &FakeSession::new(), &th_url, &ControlRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(err.to_string(), "top_level: interrupted");
    }

    #[tokio::test]
    async fn test_control_goes_through_engine_network() {
        let th_url = serve(helper_app()).await;
        let endpoint = th_url.trim_start_matches("http://").to_string();
        let th_url = format!("https://{endpoint}/");
        let session = FakeSession::new();
        let request = ControlRequest {
            http_request: "https://example.com/".to_string(),
            ..ControlRequest::default()
        };

        control(&CancellationToken::new(), &session, &th_url, &request)
            .await
            .unwrap();

        let sent = serde_json::to_vec(&request).unwrap().len() as u64;
        assert_eq!(session.counter.bytes_sent(), sent);
        assert!(session.counter.bytes_received() > 0);
        let tactics = session.stats.lookup_tactics(&endpoint);
        assert_eq!(tactics.len(), 1);
        assert_eq!(tactics[0].count_started, 1);
        assert_eq!(tactics[0].count_success, 1);
    }
}
