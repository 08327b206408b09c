use super::{Trace, TracedConn};
use crate::error::NetError;
use crate::netx::{BoxedConn, Dialer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dialer that records every connect attempt in a [`Trace`].
pub struct DialerTrace {
    inner: Arc<dyn Dialer>,
    trace: Arc<Trace>,
}

impl DialerTrace {
    pub(super) fn new(inner: Arc<dyn Dialer>, trace: Arc<Trace>) -> Self {
        Self { inner, trace }
    }
}

#[async_trait]
impl Dialer for DialerTrace {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<BoxedConn, NetError> {
        let started = Instant::now();
        let res = self.inner.dial(cancel, network, address).await;
        let finished = Instant::now();
        self.trace
            .on_connect_done(started, network, address, res.as_ref().err(), finished);
        let conn = res?;
        Ok(Box::new(TracedConn::new(
            conn,
            Arc::clone(&self.trace),
            network,
            address,
        )))
    }

    fn close_idle_connections(&self) {
        self.inner.close_idle_connections();
    }
}
