//! Tactic selection policies.
//!
//! A policy turns a `(domain, port)` pair into an ordered list of tactics.
//! Policies compose: the static policy wraps the stats policy, which wraps
//! the null policy. Building a policy never fails; broken persisted state
//! just means we fall back to the wrapped policy.

use super::stats::compare_by_success_rate;
use super::{HttpsDialerStatsManager, HttpsDialerTactic};
use crate::error::{FailureKind, NetError, Operation};
use crate::kvstore::KeyValueStore;
use crate::netx::{Resolver, join_host_port};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Produces the tactics to try, in order, for a domain endpoint.
#[async_trait]
pub trait HttpsDialerPolicy: Send + Sync {
    /// Returns a non-empty list or an error.
    async fn lookup_tactics(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        port: &str,
    ) -> Result<Vec<HttpsDialerTactic>, NetError>;
}

fn dedup_by_summary(tactics: Vec<HttpsDialerTactic>) -> Vec<HttpsDialerTactic> {
    let mut seen = HashSet::new();
    tactics
        .into_iter()
        .filter(|t| seen.insert(t.summary()))
        .collect()
}

/// Resolves the domain and dials every address with SNI set to the domain.
pub struct NullPolicy {
    resolver: Arc<dyn Resolver>,
}

impl NullPolicy {
    #[must_use]
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl HttpsDialerPolicy for NullPolicy {
    async fn lookup_tactics(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        port: &str,
    ) -> Result<Vec<HttpsDialerTactic>, NetError> {
        let addrs = self.resolver.lookup_host(cancel, domain).await?;
        if addrs.is_empty() {
            return Err(NetError::new(FailureKind::DnsNoAnswer, Operation::Resolve));
        }
        Ok(addrs
            .iter()
            .map(|ip| HttpsDialerTactic::direct(&ip.to_string(), port, domain))
            .collect())
    }
}

/// Ranks the fallback's tactics together with the historical ones.
pub struct StatsPolicy {
    stats: Arc<HttpsDialerStatsManager>,
    fallback: Arc<dyn HttpsDialerPolicy>,
}

impl StatsPolicy {
    #[must_use]
    pub fn new(stats: Arc<HttpsDialerStatsManager>, fallback: Arc<dyn HttpsDialerPolicy>) -> Self {
        Self { stats, fallback }
    }
}

/// Orders tactics: those with at least one success (best rate first), then
/// those never completed, then those that only failed. The last two groups
/// keep their input order.
fn rank_tactics(
    tactics: Vec<HttpsDialerTactic>,
    history: &BTreeMap<String, super::TacticStats>,
) -> Vec<HttpsDialerTactic> {
    let mut succeeded = Vec::new();
    let mut untried = Vec::new();
    let mut failed = Vec::new();
    for tactic in tactics {
        match history.get(&tactic.summary()) {
            Some(stats) if stats.count_success > 0 => succeeded.push((tactic, stats)),
            Some(stats) if stats.completed() > 0 => failed.push(tactic),
            _ => untried.push(tactic),
        }
    }
    succeeded.sort_by(|a, b| compare_by_success_rate(a.1, b.1));
    succeeded
        .into_iter()
        .map(|(t, _)| t)
        .chain(untried)
        .chain(failed)
        .collect()
}

#[async_trait]
impl HttpsDialerPolicy for StatsPolicy {
    async fn lookup_tactics(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        port: &str,
    ) -> Result<Vec<HttpsDialerTactic>, NetError> {
        let history: BTreeMap<String, _> = self
            .stats
            .lookup_tactics(&join_host_port(domain, port))
            .into_iter()
            .map(|s| (s.tactic.summary(), s))
            .collect();

        let mut tactics = match self.fallback.lookup_tactics(cancel, domain, port).await {
            Ok(tactics) => tactics,
            Err(e) if history.is_empty() || e.is_interrupted() => return Err(e),
            Err(e) => {
                debug!(%domain, error = %e, "fallback policy failed, using history only");
                Vec::new()
            }
        };
        // BTreeMap iteration yields the history sorted by summary.
        tactics.extend(history.values().map(|s| s.tactic.clone()));
        let tactics = rank_tactics(dedup_by_summary(tactics), &history);
        debug!(%domain, %port, count = tactics.len(), "stats policy tactics");
        Ok(tactics)
    }
}

/// Key under which the static policy configuration is stored.
pub const STATIC_POLICY_KEY: &str = "httpsdialerstatic.conf";

/// Version of the static policy configuration.
pub const STATIC_POLICY_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum StaticPolicyError {
    #[error("no static policy configured")]
    Missing,
    #[error("cannot parse static policy: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("static policy version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

/// User-provided tactics, keyed by domain endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticPolicyConfig {
    #[serde(rename = "DomainEndpoints")]
    pub domain_endpoints: BTreeMap<String, Vec<HttpsDialerTactic>>,
    #[serde(rename = "Version")]
    pub version: u32,
}

/// Emits the configured tactics before the fallback's.
pub struct StaticPolicy {
    config: StaticPolicyConfig,
    fallback: Arc<dyn HttpsDialerPolicy>,
}

impl StaticPolicy {
    /// Load the configuration from `kv`.
    pub fn new(
        kv: &dyn KeyValueStore,
        fallback: Arc<dyn HttpsDialerPolicy>,
    ) -> Result<Self, StaticPolicyError> {
        let data = kv
            .get(STATIC_POLICY_KEY)
            .map_err(|_| StaticPolicyError::Missing)?;
        let config: StaticPolicyConfig = serde_json::from_slice(&data)?;
        if config.version != STATIC_POLICY_VERSION {
            return Err(StaticPolicyError::VersionMismatch {
                found: config.version,
                expected: STATIC_POLICY_VERSION,
            });
        }
        Ok(Self { config, fallback })
    }
}

#[async_trait]
impl HttpsDialerPolicy for StaticPolicy {
    async fn lookup_tactics(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        port: &str,
    ) -> Result<Vec<HttpsDialerTactic>, NetError> {
        let mut tactics = self
            .config
            .domain_endpoints
            .get(&join_host_port(domain, port))
            .cloned()
            .unwrap_or_default();
        match self.fallback.lookup_tactics(cancel, domain, port).await {
            Ok(more) => tactics.extend(more),
            Err(e) if tactics.is_empty() || e.is_interrupted() => return Err(e),
            Err(e) => debug!(%domain, error = %e, "fallback policy failed, using static tactics"),
        }
        Ok(dedup_by_summary(tactics))
    }
}

/// Build the policy chain used by the engine.
#[must_use]
pub fn new_https_dialer_policy(
    kv: &dyn KeyValueStore,
    resolver: Arc<dyn Resolver>,
    stats: Arc<HttpsDialerStatsManager>,
) -> Arc<dyn HttpsDialerPolicy> {
    let null: Arc<dyn HttpsDialerPolicy> = Arc::new(NullPolicy::new(resolver));
    let stats_policy: Arc<dyn HttpsDialerPolicy> = Arc::new(StatsPolicy::new(stats, null));
    match StaticPolicy::new(kv, Arc::clone(&stats_policy)) {
        Ok(policy) => {
            info!("using static HTTPS dialer policy");
            Arc::new(policy)
        }
        Err(StaticPolicyError::Missing) => stats_policy,
        Err(e) => {
            info!(error = %e, "ignoring static HTTPS dialer policy");
            stats_policy
        }
    }
}
