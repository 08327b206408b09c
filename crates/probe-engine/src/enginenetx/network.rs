use super::{HttpsDialer, HttpsDialerStatsManager, StatsError, new_https_dialer_policy};
use crate::config::DialConfig;
use crate::kvstore::KeyValueStore;
use crate::netx::{
    ByteCounter, ByteCountingTransport, DialerWithResolver, EngineHttpTransport, HttpTransport,
    Resolver, RustlsHandshaker, TcpDialer,
};
use std::sync::Arc;
use tracing::{debug, info};

/// The network used by the engine itself (not for measuring).
///
/// Cleartext connections use a plain resolving dialer; TLS connections go
/// through the policy-driven [`HttpsDialer`]. Call [`Network::close`] when
/// done so that idle connections are released and statistics persisted.
pub struct Network {
    resolver: Arc<dyn Resolver>,
    stats: Arc<HttpsDialerStatsManager>,
    txp: Arc<dyn HttpTransport>,
}

impl Network {
    #[must_use]
    pub fn new(
        counter: Arc<ByteCounter>,
        kv: Arc<dyn KeyValueStore>,
        resolver: Arc<dyn Resolver>,
        config: &DialConfig,
    ) -> Self {
        let tcp = Arc::new(TcpDialer::new(config.tcp_connect_timeout));
        let dialer = Arc::new(DialerWithResolver::new(Arc::clone(&resolver), tcp.clone()));
        let stats = Arc::new(HttpsDialerStatsManager::new(Arc::clone(&kv)));
        let policy = new_https_dialer_policy(kv.as_ref(), Arc::clone(&resolver), Arc::clone(&stats));
        let https = Arc::new(HttpsDialer::new(
            tcp,
            Arc::new(RustlsHandshaker::new(config.tls_handshake_timeout)),
            policy,
            Arc::clone(&stats),
        ));
        let txp: Arc<dyn HttpTransport> = Arc::new(EngineHttpTransport::new(dialer, https));
        let txp = Arc::new(ByteCountingTransport::new(txp, counter));
        debug!(resolver = resolver.network(), "engine network ready");
        Self::with_transport(resolver, stats, txp)
    }

    /// Assemble a network from already built parts.
    #[must_use]
    pub fn with_transport(
        resolver: Arc<dyn Resolver>,
        stats: Arc<HttpsDialerStatsManager>,
        txp: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            resolver,
            stats,
            txp,
        }
    }

    #[must_use]
    pub fn http_transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.txp)
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<HttpsDialerStatsManager> {
        &self.stats
    }

    /// Close idle connections of the transport and the resolver, then
    /// persist statistics. All steps run even if an earlier one failed.
    pub fn close(&self) -> Result<(), StatsError> {
        self.txp.close_idle_connections();
        self.resolver.close_idle_connections();
        let res = self.stats.close();
        info!(ok = res.is_ok(), "engine network closed");
        res
    }
}
