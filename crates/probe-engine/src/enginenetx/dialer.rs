use super::{HttpsDialerPolicy, HttpsDialerStatsManager, HttpsDialerTactic};
use crate::error::{FailureKind, NetError, Operation};
use crate::netx::{
    BoxedConn, Dialer, TlsConfig, TlsDialer, TlsHandshaker, join_host_port, split_host_port,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Dials TLS connections by trying, one after the other, the tactics
/// proposed by a policy and recording each outcome in the stats manager.
pub struct HttpsDialer {
    dialer: Arc<dyn Dialer>,
    handshaker: Arc<dyn TlsHandshaker>,
    policy: Arc<dyn HttpsDialerPolicy>,
    stats: Arc<HttpsDialerStatsManager>,
}

impl HttpsDialer {
    #[must_use]
    pub fn new(
        dialer: Arc<dyn Dialer>,
        handshaker: Arc<dyn TlsHandshaker>,
        policy: Arc<dyn HttpsDialerPolicy>,
        stats: Arc<HttpsDialerStatsManager>,
    ) -> Self {
        Self {
            dialer,
            handshaker,
            policy,
            stats,
        }
    }

    async fn dial_tactic(
        &self,
        cancel: &CancellationToken,
        tactic: &HttpsDialerTactic,
    ) -> Result<BoxedConn, NetError> {
        let conn = self.dialer.dial(cancel, "tcp", &tactic.endpoint()).await?;
        let config = TlsConfig::new(tactic.sni.clone())
            .with_verify_hostname(tactic.verify_hostname.clone())
            .with_alpn(&["http/1.1"]);
        let (conn, state) = self.handshaker.handshake(cancel, conn, &config).await?;
        debug!(
            tactic = %tactic.summary(),
            tls_version = %state.tls_version,
            alpn = %state.negotiated_protocol,
            "tls connection established"
        );
        Ok(conn)
    }

    /// Connect to `address` (`host:port`), returning the first tactic that
    /// works or the last failure.
    pub async fn dial_tls(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<BoxedConn, NetError> {
        let (host, port) = split_host_port(address)
            .map_err(|e| NetError::new(FailureKind::Unknown(e.to_string()), Operation::Connect))?;
        // The order is fixed for the whole dial, whatever we record below.
        let tactics = self.policy.lookup_tactics(cancel, &host, &port).await?;
        // Stats are keyed by the endpoint we were asked for, never by the
        // tactic's SNI or verify hostname.
        let domain_endpoint = join_host_port(&host, &port);

        let mut last_err = NetError::new(FailureKind::DnsNoAnswer, Operation::Resolve);
        for tactic in &tactics {
            if cancel.is_cancelled() {
                return Err(NetError::interrupted(Operation::Connect));
            }
            self.stats.record_started(&domain_endpoint, tactic);
            match self.dial_tactic(cancel, tactic).await {
                Ok(conn) => {
                    self.stats.record_success(&domain_endpoint, tactic);
                    return Ok(conn);
                }
                Err(e) => {
                    info!(tactic = %tactic.summary(), failure = %e, "tactic failed");
                    self.stats.record_failure(&domain_endpoint, tactic, &e);
                    if e.is_interrupted() {
                        return Err(e);
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl TlsDialer for HttpsDialer {
    async fn dial_tls(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<BoxedConn, NetError> {
        HttpsDialer::dial_tls(self, cancel, address).await
    }

    fn close_idle_connections(&self) {
        self.dialer.close_idle_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginenetx::StatsPolicy;
    use crate::kvstore::MemoryKeyValueStore;
    use crate::netx::TlsConnectionState;
    use std::sync::Mutex;

    /// Fails the connect for every address listed in `refuse`.
    struct FakeDialer {
        refuse: Vec<String>,
        dialed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(
            &self,
            _cancel: &CancellationToken,
            _network: &str,
            address: &str,
        ) -> Result<BoxedConn, NetError> {
            self.dialed.lock().unwrap().push(address.to_string());
            if self.refuse.iter().any(|a| a == address) {
                return Err(NetError::new(
                    FailureKind::ConnectionRefused,
                    Operation::Connect,
                ));
            }
            let (client, _server) = tokio::io::duplex(16);
            Ok(Box::new(client))
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl TlsHandshaker for AcceptAll {
        async fn handshake(
            &self,
            _cancel: &CancellationToken,
            conn: BoxedConn,
            config: &TlsConfig,
        ) -> Result<(BoxedConn, TlsConnectionState), NetError> {
            assert_eq!(config.alpn, ["http/1.1"]);
            Ok((conn, TlsConnectionState::default()))
        }
    }

    struct FixedPolicy(Vec<HttpsDialerTactic>);

    #[async_trait]
    impl HttpsDialerPolicy for FixedPolicy {
        async fn lookup_tactics(
            &self,
            _cancel: &CancellationToken,
            _domain: &str,
            _port: &str,
        ) -> Result<Vec<HttpsDialerTactic>, NetError> {
            Ok(self.0.clone())
        }
    }

    fn setup(refuse: &[&str]) -> (HttpsDialer, Arc<FakeDialer>, Arc<HttpsDialerStatsManager>) {
        let s1 = HttpsDialerTactic::direct("10.0.0.1", "443", "example.com");
        let s2 = HttpsDialerTactic::direct("10.0.0.2", "443", "example.com");
        setup_with(refuse, vec![s1, s2])
    }

    fn setup_with(
        refuse: &[&str],
        tactics: Vec<HttpsDialerTactic>,
    ) -> (HttpsDialer, Arc<FakeDialer>, Arc<HttpsDialerStatsManager>) {
        let dialer = Arc::new(FakeDialer {
            refuse: refuse.iter().map(|s| (*s).to_string()).collect(),
            dialed: Mutex::new(Vec::new()),
        });
        let stats = Arc::new(HttpsDialerStatsManager::new(Arc::new(
            MemoryKeyValueStore::new(),
        )));
        let https = HttpsDialer::new(
            dialer.clone(),
            Arc::new(AcceptAll),
            Arc::new(FixedPolicy(tactics)),
            stats.clone(),
        );
        (https, dialer, stats)
    }

    #[tokio::test]
    async fn test_first_tactic_fails_second_wins() {
        let (https, dialer, stats) = setup(&["10.0.0.1:443"]);
        https
            .dial_tls(&CancellationToken::new(), "example.com:443")
            .await
            .unwrap();

        assert_eq!(
            *dialer.dialed.lock().unwrap(),
            ["10.0.0.1:443", "10.0.0.2:443"]
        );
        let tallies = stats.lookup_tactics("example.com:443");
        let s1 = tallies.iter().find(|t| t.tactic.address == "10.0.0.1").unwrap();
        let s2 = tallies.iter().find(|t| t.tactic.address == "10.0.0.2").unwrap();
        assert_eq!((s1.count_failure, s1.count_success), (1, 0));
        assert_eq!((s2.count_failure, s2.count_success), (0, 1));
        assert_eq!(s1.historic_failures["connection_refused"], 1);
    }

    #[tokio::test]
    async fn test_all_tactics_fail() {
        let (https, _, stats) = setup(&["10.0.0.1:443", "10.0.0.2:443"]);
        let err = https
            .dial_tls(&CancellationToken::new(), "example.com:443")
            .await
            .err().unwrap();
        assert_eq!(err.failure(), "connection_refused");
        assert!(
            stats
                .lookup_tactics("example.com:443")
                .iter()
                .all(|t| t.count_failure == 1)
        );
    }

    #[tokio::test]
    async fn test_cancelled_dial_stops_early() {
        let (https, dialer, _) = setup(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = https.dial_tls(&cancel, "example.com:443").await.err().unwrap();
        assert!(err.is_interrupted());
        assert!(dialer.dialed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fronted_tactic_recorded_under_dialed_endpoint() {
        let fronted = HttpsDialerTactic {
            address: "10.0.0.3".to_string(),
            port: "443".to_string(),
            sni: "cdn.example.net".to_string(),
            verify_hostname: "front.example".to_string(),
        };
        let (https, _, stats) = setup_with(&[], vec![fronted.clone()]);
        https
            .dial_tls(&CancellationToken::new(), "example.com:443")
            .await
            .unwrap();

        assert!(stats.lookup_tactics("front.example:443").is_empty());
        let tallies = stats.lookup_tactics("example.com:443");
        assert_eq!(tallies.len(), 1);
        assert_eq!(tallies[0].tactic, fronted);
        assert_eq!(tallies[0].count_success, 1);

        // The stats policy for the same endpoint sees the fronted tactic
        // and ranks it ahead of an untried direct one.
        let direct = HttpsDialerTactic::direct("10.0.0.1", "443", "example.com");
        let policy = StatsPolicy::new(stats, Arc::new(FixedPolicy(vec![direct.clone()])));
        let tactics = policy
            .lookup_tactics(&CancellationToken::new(), "example.com", "443")
            .await
            .unwrap();
        assert_eq!(tactics, vec![fronted, direct]);
    }
}
