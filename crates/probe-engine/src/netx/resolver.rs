//! Resolver backed by the operating system (`getaddrinfo` via tokio).

use super::Resolver;
use crate::error::{FailureKind, NetError, Operation};
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl SystemResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn classify_lookup_error(err: io::Error) -> NetError {
    // getaddrinfo reports NXDOMAIN as an uncategorised error whose message
    // mentions the name not being known.
    let msg = err.to_string().to_lowercase();
    let kind = if msg.contains("not known") || msg.contains("no such host") {
        FailureKind::DnsNxdomain
    } else if msg.contains("no address") {
        FailureKind::DnsNoAnswer
    } else {
        FailureKind::from_io_error(&err)
    };
    NetError::new(kind, Operation::Resolve).with_source(err)
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(
        &self,
        cancel: &CancellationToken,
        domain: &str,
    ) -> Result<Vec<IpAddr>, NetError> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        debug!(%domain, "resolving");
        let addrs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::interrupted(Operation::Resolve)),
            res = tokio::net::lookup_host((domain, 0)) => res.map_err(classify_lookup_error)?,
        };
        let mut out: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !out.contains(&addr.ip()) {
                out.push(addr.ip());
            }
        }
        if out.is_empty() {
            return Err(NetError::new(FailureKind::DnsNoAnswer, Operation::Resolve));
        }
        Ok(out)
    }

    fn network(&self) -> &'static str {
        "system"
    }

    fn close_idle_connections(&self) {
        debug!("system resolver keeps no idle connections");
    }
}
