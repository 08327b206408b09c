use crate::netx::join_host_port;
use serde::{Deserialize, Serialize};

/// One way of establishing a TLS connection to a domain endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HttpsDialerTactic {
    /// IP address to connect to.
    #[serde(rename = "Address")]
    pub address: String,
    /// Port to connect to.
    #[serde(rename = "Port")]
    pub port: String,
    /// SNI to send; empty disables SNI.
    #[serde(rename = "SNI")]
    pub sni: String,
    /// Hostname the certificate must be valid for.
    #[serde(rename = "VerifyHostname")]
    pub verify_hostname: String,
}

impl HttpsDialerTactic {
    /// The default tactic for `domain` reached at `address:port`.
    #[must_use]
    pub fn direct(address: &str, port: &str, domain: &str) -> Self {
        Self {
            address: address.to_string(),
            port: port.to_string(),
            sni: domain.to_string(),
            verify_hostname: domain.to_string(),
        }
    }

    /// The `ip:port` endpoint to dial.
    #[must_use]
    pub fn endpoint(&self) -> String {
        join_host_port(&self.address, &self.port)
    }

    /// Stable key identifying this tactic in the stats table.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} sni={} verify={}",
            self.endpoint(),
            self.sni,
            self.verify_hostname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        let tactic = HttpsDialerTactic::direct("2001:db8::1", "443", "example.com");
        assert_eq!(
            tactic.summary(),
            "[2001:db8::1]:443 sni=example.com verify=example.com"
        );
    }
}
