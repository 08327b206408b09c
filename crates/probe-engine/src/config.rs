//! Engine configuration.
//!
//! Loaded from YAML; every field has a default so an empty file (or no
//! file at all) is a valid configuration:
//!
//! ```yaml
//! state_dir: /var/lib/probe-engine
//! asn_database: /usr/share/probe-engine/asn.csv
//! tcp_connect_timeout: 15s
//! tls_handshake_timeout: 10s
//! test_helpers:
//!   web-connectivity:
//!     - address: https://th.example.org
//!       type: https
//! ```

use crate::model::Service;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("probe-engine")
}

fn default_tcp_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_tls_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_quic_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the key-value store.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Optional `prefix,asn,org` CSV used for ASN lookups.
    #[serde(default)]
    pub asn_database: Option<PathBuf>,

    /// Test helpers by name (e.g. `web-connectivity`).
    #[serde(default)]
    pub test_helpers: BTreeMap<String, Vec<Service>>,

    #[serde(default = "default_tcp_connect_timeout", with = "humantime_serde")]
    pub tcp_connect_timeout: Duration,

    #[serde(default = "default_tls_handshake_timeout", with = "humantime_serde")]
    pub tls_handshake_timeout: Duration,

    #[serde(default = "default_quic_handshake_timeout", with = "humantime_serde")]
    pub quic_handshake_timeout: Duration,

    #[serde(default = "default_control_timeout", with = "humantime_serde")]
    pub control_timeout: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            asn_database: None,
            test_helpers: BTreeMap::new(),
            tcp_connect_timeout: default_tcp_connect_timeout(),
            tls_handshake_timeout: default_tls_handshake_timeout(),
            quic_handshake_timeout: default_quic_handshake_timeout(),
            control_timeout: default_control_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("Failed to parse engine configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text)
    }

    /// Directory of the key-value store inside `state_dir`.
    #[must_use]
    pub fn kvstore_dir(&self) -> PathBuf {
        self.state_dir.join("kvstore2")
    }

    #[must_use]
    pub fn dial_config(&self) -> DialConfig {
        DialConfig {
            tcp_connect_timeout: self.tcp_connect_timeout,
            tls_handshake_timeout: self.tls_handshake_timeout,
            quic_handshake_timeout: self.quic_handshake_timeout,
        }
    }
}

/// Timeouts used when building dialers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialConfig {
    pub tcp_connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub quic_handshake_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        EngineConfig::default().dial_config()
    }
}
