//! TCP dialers.

use super::{BoxedConn, Dialer, Resolver, join_host_port, split_host_port};
use crate::error::{FailureKind, NetError, Operation};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default timeout for a single TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Dials IP endpoints only; does not resolve domain names.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TcpDialer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn check_network(network: &str) -> Result<(), NetError> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => Err(NetError::new(
            FailureKind::Unknown(format!("unsupported network: {other}")),
            Operation::Connect,
        )),
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<BoxedConn, NetError> {
        check_network(network)?;
        let addr: SocketAddr = address.parse().map_err(|_| {
            NetError::new(
                FailureKind::Unknown(format!("not an IP endpoint: {address}")),
                Operation::Connect,
            )
        })?;
        debug!(%addr, "tcp connect");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NetError::interrupted(Operation::Connect)),
            res = tokio::time::timeout(self.timeout, TcpStream::connect(addr)) => match res {
                Err(_) => Err(NetError::timeout(Operation::Connect)),
                Ok(Err(e)) => Err(NetError::from_io(e, Operation::Connect)),
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    Ok(Box::new(stream) as BoxedConn)
                }
            },
        }
    }
}

/// Resolves the host part of the endpoint and tries each address in turn.
pub struct DialerWithResolver {
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
}

impl DialerWithResolver {
    #[must_use]
    pub fn new(resolver: Arc<dyn Resolver>, dialer: Arc<dyn Dialer>) -> Self {
        Self { resolver, dialer }
    }
}

#[async_trait]
impl Dialer for DialerWithResolver {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<BoxedConn, NetError> {
        let (host, port) = split_host_port(address).map_err(|e| {
            NetError::new(FailureKind::Unknown(e.to_string()), Operation::Connect)
        })?;
        let addrs = self.resolver.lookup_host(cancel, &host).await?;
        let mut last_err = NetError::new(FailureKind::DnsNoAnswer, Operation::Resolve);
        for ip in addrs {
            let endpoint = join_host_port(&ip.to_string(), &port);
            match self.dialer.dial(cancel, network, &endpoint).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    debug!(%endpoint, failure = %e.failure(), "dial attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn close_idle_connections(&self) {
        self.dialer.close_idle_connections();
        self.resolver.close_idle_connections();
    }
}
