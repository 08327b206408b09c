//! Measurement session.

use crate::config::EngineConfig;
use crate::enginenetx::{Network, StatsError};
use crate::kvstore::{FileSystemKeyValueStore, KeyValueStore};
use crate::model::Service;
use crate::netx::{AsnDatabase, AsnLookup, ByteCounter, HttpTransport, SystemResolver};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Default `User-Agent` for engine requests.
pub const USER_AGENT: &str = concat!("probe-engine/", env!("CARGO_PKG_VERSION"));

/// What experiments need from the session they run in.
pub trait ExperimentSession: Send + Sync {
    /// Transport for talking to backend services.
    fn default_http_transport(&self) -> Arc<dyn HttpTransport>;

    /// Upper bound for one backend request, if any.
    fn http_timeout(&self) -> Option<Duration> {
        None
    }

    /// Declared test helpers called `name`, if any.
    fn test_helpers_by_name(&self, name: &str) -> Option<Vec<Service>>;

    fn asn_lookup(&self) -> &dyn AsnLookup;

    fn user_agent(&self) -> &str {
        USER_AGENT
    }
}

/// Session built from an [`EngineConfig`].
pub struct Session {
    id: Uuid,
    config: EngineConfig,
    asn: AsnDatabase,
    kv_store: Arc<dyn KeyValueStore>,
    byte_counter: Arc<ByteCounter>,
    network: Network,
}

impl Session {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let kv_store: Arc<dyn KeyValueStore> = Arc::new(
            FileSystemKeyValueStore::new(config.kvstore_dir()).with_context(|| {
                format!("Failed to open key-value store in {}", config.kvstore_dir().display())
            })?,
        );
        let asn = match &config.asn_database {
            Some(path) => AsnDatabase::load(path)
                .with_context(|| format!("Failed to load ASN database {}", path.display()))?,
            None => AsnDatabase::empty(),
        };
        let byte_counter = Arc::new(ByteCounter::new());
        let network = Network::new(
            Arc::clone(&byte_counter),
            Arc::clone(&kv_store),
            Arc::new(SystemResolver::new()),
            &config.dial_config(),
        );
        let id = Uuid::new_v4();
        info!(
            session_id = %id,
            state_dir = %config.state_dir.display(),
            asn_entries = asn.len(),
            "session ready"
        );
        Ok(Self {
            id,
            config,
            asn,
            kv_store,
            byte_counter,
            network,
        })
    }

    /// Random identifier tagging this session's log records.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn network(&self) -> &Network {
        &self.network
    }

    #[must_use]
    pub fn kv_store(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv_store
    }

    #[must_use]
    pub fn byte_counter(&self) -> &Arc<ByteCounter> {
        &self.byte_counter
    }

    /// Release connections and persist dialer statistics.
    pub fn close(&self) -> Result<(), StatsError> {
        info!(
            session_id = %self.id,
            sent_kib = self.byte_counter.kibibytes_sent(),
            received_kib = self.byte_counter.kibibytes_received(),
            "closing session"
        );
        self.network.close()
    }
}

impl ExperimentSession for Session {
    fn default_http_transport(&self) -> Arc<dyn HttpTransport> {
        self.network.http_transport()
    }

    fn http_timeout(&self) -> Option<Duration> {
        Some(self.config.control_timeout)
    }

    fn test_helpers_by_name(&self, name: &str) -> Option<Vec<Service>> {
        self.config.test_helpers.get(name).cloned()
    }

    fn asn_lookup(&self) -> &dyn AsnLookup {
        &self.asn
    }
}
