//! IP address to autonomous system lookups.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AsnError {
    #[error("invalid IP address: {0}")]
    InvalidIp(String),
    #[error("no ASN entry for {0}")]
    NotFound(String),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps an IP address to its autonomous system number and organization.
pub trait AsnLookup: Send + Sync {
    fn lookup_asn(&self, ip: &str) -> Result<(u32, String), AsnError>;
}

#[derive(Debug, Clone)]
struct AsnEntry {
    network: IpNetwork,
    asn: u32,
    org: String,
}

/// Prefix table loaded from a `prefix,asn,org` CSV file.
///
/// Lookups pick the longest matching prefix. Blank lines and lines starting
/// with `#` are ignored.
#[derive(Debug, Clone, Default)]
pub struct AsnDatabase {
    entries: Vec<AsnEntry>,
}

impl AsnDatabase {
    /// A database that knows nothing; every lookup fails.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, AsnError> {
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(3, ',');
            let (Some(prefix), Some(asn)) = (fields.next(), fields.next()) else {
                return Err(AsnError::Parse {
                    line: idx + 1,
                    reason: "expected prefix,asn,org".to_string(),
                });
            };
            let network: IpNetwork = prefix.trim().parse().map_err(|e| AsnError::Parse {
                line: idx + 1,
                reason: format!("{e}"),
            })?;
            let asn = asn
                .trim()
                .trim_start_matches("AS")
                .parse::<u32>()
                .map_err(|e| AsnError::Parse {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            let org = fields.next().unwrap_or("").trim().to_string();
            entries.push(AsnEntry { network, asn, org });
        }
        // Longest prefix first so the first hit is the best one.
        entries.sort_by(|a, b| b.network.prefix().cmp(&a.network.prefix()));
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, AsnError> {
        let text = std::fs::read_to_string(path)?;
        let db = Self::parse(&text)?;
        info!(path = %path.display(), entries = db.len(), "loaded ASN database");
        Ok(db)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AsnLookup for AsnDatabase {
    fn lookup_asn(&self, ip: &str) -> Result<(u32, String), AsnError> {
        let addr: IpAddr = ip.parse().map_err(|_| AsnError::InvalidIp(ip.to_string()))?;
        let hit = self.entries.iter().find(|e| e.network.contains(addr));
        match hit {
            Some(entry) => Ok((entry.asn, entry.org.clone())),
            None => {
                debug!(%ip, "no ASN entry");
                Err(AsnError::NotFound(ip.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# prefix,asn,org
8.8.8.0/24,15169,Google LLC
8.0.0.0/8,3356,Level 3
2001:4860::/32,AS15169,Google LLC
";

    #[test]
    fn test_longest_prefix_wins() {
        let db = AsnDatabase::parse(SAMPLE).unwrap();
        assert_eq!(db.len(), 3);
        assert_eq!(
            db.lookup_asn("8.8.8.8").unwrap(),
            (15169, "Google LLC".to_string())
        );
        assert_eq!(db.lookup_asn("8.1.1.1").unwrap().0, 3356);
        assert_eq!(db.lookup_asn("2001:4860::8888").unwrap().0, 15169);
    }

    #[test]
    fn test_lookup_failures() {
        let db = AsnDatabase::parse(SAMPLE).unwrap();
        assert!(matches!(db.lookup_asn("1.1.1.1"), Err(AsnError::NotFound(_))));
        assert!(matches!(db.lookup_asn("nope"), Err(AsnError::InvalidIp(_))));
        assert!(AsnDatabase::empty().lookup_asn("8.8.8.8").is_err());
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = AsnDatabase::parse("8.8.8.0/24,15169,x\nbad-line\n").unwrap_err();
        assert!(matches!(err, AsnError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asn.csv");
        std::fs::write(&path, SAMPLE).unwrap();
        let db = AsnDatabase::load(&path).unwrap();
        assert!(!db.is_empty());
    }
}
