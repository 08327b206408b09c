//! Persistent per-tactic dial statistics.
//!
//! The table is loaded once from the key-value store when the manager is
//! created and written back once by [`HttpsDialerStatsManager::close`].
//! Loading never fails: a missing, corrupt or outdated blob yields an empty
//! table.

use super::HttpsDialerTactic;
use crate::error::NetError;
use crate::kvstore::{KeyValueStore, KvStoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Key under which the stats table is stored.
pub const STATS_KEY: &str = "httpsdialerstats.state";

/// Version of the serialized table. Blobs with another version are ignored.
pub const STATS_CONTAINER_VERSION: u32 = 5;

/// Entries not updated for this long are pruned on close.
pub const STATS_EXPIRE_DAYS: i64 = 7;

/// Tactics kept per domain endpoint on close.
pub const MAX_TACTICS_PER_ENDPOINT: usize = 10;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] KvStoreError),
    #[error("stats version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("stats lock poisoned")]
    Poisoned,
}

/// Outcome tally of one tactic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticStats {
    pub count_started: u64,
    pub count_success: u64,
    pub count_failure: u64,
    pub count_interrupted: u64,
    /// Failure string to number of occurrences.
    #[serde(default)]
    pub historic_failures: BTreeMap<String, u64>,
    pub last_update: DateTime<Utc>,
    pub tactic: HttpsDialerTactic,
}

impl TacticStats {
    fn new(tactic: &HttpsDialerTactic, now: DateTime<Utc>) -> Self {
        Self {
            count_started: 0,
            count_success: 0,
            count_failure: 0,
            count_interrupted: 0,
            historic_failures: BTreeMap::new(),
            last_update: now,
            tactic: tactic.clone(),
        }
    }

    /// Attempts that ended in success or failure. Interrupted attempts are
    /// not counted.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.count_success + self.count_failure
    }

    /// Fraction of completed attempts that succeeded; zero with no attempts.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            n => self.count_success as f64 / n as f64,
        }
    }
}

/// Higher success rate first, then most recently updated first.
pub(crate) fn compare_by_success_rate(a: &TacticStats, b: &TacticStats) -> Ordering {
    b.success_rate()
        .partial_cmp(&a.success_rate())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.last_update.cmp(&a.last_update))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainEndpointStats {
    /// Tactic summary to its stats.
    pub tactics: BTreeMap<String, TacticStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsContainer {
    /// Domain endpoint (`host:port`) to its stats.
    pub domain_endpoints: BTreeMap<String, DomainEndpointStats>,
    pub version: u32,
}

impl Default for StatsContainer {
    fn default() -> Self {
        Self {
            domain_endpoints: BTreeMap::new(),
            version: STATS_CONTAINER_VERSION,
        }
    }
}

impl StatsContainer {
    fn entry(
        &mut self,
        domain_endpoint: &str,
        tactic: &HttpsDialerTactic,
        now: DateTime<Utc>,
    ) -> &mut TacticStats {
        self.domain_endpoints
            .entry(domain_endpoint.to_string())
            .or_default()
            .tactics
            .entry(tactic.summary())
            .or_insert_with(|| TacticStats::new(tactic, now))
    }

    /// Drop stale entries and keep the best tactics of each endpoint.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(STATS_EXPIRE_DAYS);
        for stats in self.domain_endpoints.values_mut() {
            stats.tactics.retain(|_, t| t.last_update >= cutoff);
            if stats.tactics.len() > MAX_TACTICS_PER_ENDPOINT {
                let mut ranked: Vec<(String, TacticStats)> =
                    std::mem::take(&mut stats.tactics).into_iter().collect();
                ranked.sort_by(|a, b| compare_by_success_rate(&a.1, &b.1));
                ranked.truncate(MAX_TACTICS_PER_ENDPOINT);
                stats.tactics = ranked.into_iter().collect();
            }
        }
        self.domain_endpoints.retain(|_, stats| !stats.tactics.is_empty());
    }
}

fn load_stats_container(kv: &dyn KeyValueStore) -> Result<StatsContainer, StatsError> {
    let data = kv.get(STATS_KEY)?;
    let container: StatsContainer = serde_json::from_slice(&data)?;
    if container.version != STATS_CONTAINER_VERSION {
        return Err(StatsError::VersionMismatch {
            found: container.version,
            expected: STATS_CONTAINER_VERSION,
        });
    }
    Ok(container)
}

/// Shared, internally synchronized stats table.
pub struct HttpsDialerStatsManager {
    kv: Arc<dyn KeyValueStore>,
    container: Mutex<StatsContainer>,
}

impl HttpsDialerStatsManager {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        let container = match load_stats_container(kv.as_ref()) {
            Ok(container) => {
                debug!(endpoints = container.domain_endpoints.len(), "loaded dialer stats");
                container
            }
            Err(StatsError::Store(KvStoreError::NotFound(_))) => StatsContainer::default(),
            Err(e) => {
                warn!(error = %e, "cannot load dialer stats, starting from scratch");
                StatsContainer::default()
            }
        };
        Self {
            kv,
            container: Mutex::new(container),
        }
    }

    fn update(
        &self,
        domain_endpoint: &str,
        tactic: &HttpsDialerTactic,
        f: impl FnOnce(&mut TacticStats),
    ) {
        let Ok(mut container) = self.container.lock() else {
            warn!("BUG: stats lock poisoned");
            return;
        };
        let now = Utc::now();
        let stats = container.entry(domain_endpoint, tactic, now);
        f(stats);
        stats.last_update = now;
    }

    /// Record that `tactic` is being tried to reach `domain_endpoint`, the
    /// `host:port` the caller asked to dial.
    pub fn record_started(&self, domain_endpoint: &str, tactic: &HttpsDialerTactic) {
        self.update(domain_endpoint, tactic, |s| s.count_started += 1);
    }

    pub fn record_success(&self, domain_endpoint: &str, tactic: &HttpsDialerTactic) {
        self.update(domain_endpoint, tactic, |s| s.count_success += 1);
    }

    /// Record a failed attempt. Interrupted attempts are tallied apart.
    pub fn record_failure(&self, domain_endpoint: &str, tactic: &HttpsDialerTactic, err: &NetError) {
        self.update(domain_endpoint, tactic, |s| {
            if err.is_interrupted() {
                s.count_interrupted += 1;
            } else {
                s.count_failure += 1;
                *s.historic_failures.entry(err.failure()).or_default() += 1;
            }
        });
    }

    /// Stats of every tactic known for `domain_endpoint`, ordered by summary.
    #[must_use]
    pub fn lookup_tactics(&self, domain_endpoint: &str) -> Vec<TacticStats> {
        let Ok(container) = self.container.lock() else {
            warn!("BUG: stats lock poisoned");
            return Vec::new();
        };
        container
            .domain_endpoints
            .get(domain_endpoint)
            .map(|d| d.tactics.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> StatsContainer {
        self.container
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Prune and persist the table.
    pub fn close(&self) -> Result<(), StatsError> {
        let data = {
            let mut container = self.container.lock().map_err(|_| StatsError::Poisoned)?;
            container.prune(Utc::now());
            serde_json::to_vec(&*container)?
        };
        self.kv.set(STATS_KEY, &data)?;
        info!(bytes = data.len(), "saved dialer stats");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, Operation};
    use crate::kvstore::MemoryKeyValueStore;

    const ENDPOINT: &str = "example.com:443";

    fn tactic(address: &str) -> HttpsDialerTactic {
        HttpsDialerTactic::direct(address, "443", "example.com")
    }

    #[test]
    fn test_corrupt_blob_gives_empty_table() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.set(STATS_KEY, b"{not json").unwrap();
        let stats = HttpsDialerStatsManager::new(kv);
        assert_eq!(stats.snapshot(), StatsContainer::default());
    }

    #[test]
    fn test_version_mismatch_gives_empty_table() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.set(STATS_KEY, br#"{"domain_endpoints": {}, "version": 1}"#)
            .unwrap();
        let stats = HttpsDialerStatsManager::new(kv);
        assert!(stats.snapshot().domain_endpoints.is_empty());
    }

    #[test]
    fn test_round_trip_through_store() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let stats = HttpsDialerStatsManager::new(kv.clone());
        let t = tactic("1.1.1.1");
        stats.record_started(ENDPOINT, &t);
        stats.record_failure(
            ENDPOINT,
            &t,
            &NetError::new(FailureKind::ConnectionReset, Operation::TlsHandshake),
        );
        stats.record_started(ENDPOINT, &t);
        stats.record_failure(ENDPOINT, &t, &NetError::interrupted(Operation::Connect));
        stats.record_started(ENDPOINT, &t);
        stats.record_success(ENDPOINT, &t);
        stats.close().unwrap();

        let reloaded = HttpsDialerStatsManager::new(kv);
        assert_eq!(reloaded.snapshot(), stats.snapshot());
        let tallies = reloaded.lookup_tactics("example.com:443");
        assert_eq!(tallies.len(), 1);
        assert_eq!(tallies[0].count_started, 3);
        assert_eq!(tallies[0].count_success, 1);
        assert_eq!(tallies[0].count_failure, 1);
        assert_eq!(tallies[0].count_interrupted, 1);
        assert_eq!(tallies[0].historic_failures["connection_reset"], 1);
        assert!((tallies[0].success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_prune_expired_and_excess() {
        let now = Utc::now();
        let mut container = StatsContainer::default();
        let old = tactic("9.9.9.9");
        container.entry(ENDPOINT, &old, now - chrono::Duration::days(8));
        for i in 0..12 {
            let t = tactic(&format!("10.0.0.{i}"));
            let entry = container.entry(ENDPOINT, &t, now);
            entry.count_success = i;
            entry.count_failure = 12 - i;
        }
        container.prune(now);
        let tactics = &container.domain_endpoints["example.com:443"].tactics;
        assert_eq!(tactics.len(), MAX_TACTICS_PER_ENDPOINT);
        assert!(!tactics.contains_key(&old.summary()));
        // The two worst performers are gone.
        assert!(!tactics.contains_key(&tactic("10.0.0.0").summary()));
        assert!(!tactics.contains_key(&tactic("10.0.0.1").summary()));
    }

    #[test]
    fn test_close_surfaces_store_errors() {
        struct ReadOnly;
        impl KeyValueStore for ReadOnly {
            fn get(&self, key: &str) -> Result<Vec<u8>, KvStoreError> {
                Err(KvStoreError::NotFound(key.to_string()))
            }
            fn set(&self, _key: &str, _value: &[u8]) -> Result<(), KvStoreError> {
                Err(KvStoreError::Io(std::io::Error::other("read-only")))
            }
        }
        let stats = HttpsDialerStatsManager::new(Arc::new(ReadOnly));
        assert!(matches!(stats.close(), Err(StatsError::Store(_))));
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let stats = Arc::new(HttpsDialerStatsManager::new(Arc::new(
            MemoryKeyValueStore::new(),
        )));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let t = tactic("1.1.1.1");
                    stats.record_started(ENDPOINT, &t);
                    stats.record_success(ENDPOINT, &t);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let tallies = stats.lookup_tactics("example.com:443");
        assert_eq!(tallies[0].count_started, 400);
        assert_eq!(tallies[0].count_success, 400);
    }
}
