//! Byte accounting for HTTP traffic.

use super::HttpTransport;
use crate::error::NetError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Running totals of bytes sent and received.
#[derive(Debug, Default)]
pub struct ByteCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn count_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn kibibytes_sent(&self) -> f64 {
        self.bytes_sent() as f64 / 1024.0
    }

    #[must_use]
    pub fn kibibytes_received(&self) -> f64 {
        self.bytes_received() as f64 / 1024.0
    }
}

/// Counts request and response body bytes passing through `inner`.
pub struct ByteCountingTransport {
    inner: Arc<dyn HttpTransport>,
    counter: Arc<ByteCounter>,
}

impl ByteCountingTransport {
    #[must_use]
    pub fn new(inner: Arc<dyn HttpTransport>, counter: Arc<ByteCounter>) -> Self {
        Self { inner, counter }
    }
}

#[async_trait]
impl HttpTransport for ByteCountingTransport {
    async fn round_trip(
        &self,
        cancel: &CancellationToken,
        req: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, NetError> {
        self.counter.count_sent(req.body().len());
        let resp = self.inner.round_trip(cancel, req).await?;
        self.counter.count_received(resp.body().len());
        Ok(resp)
    }

    fn close_idle_connections(&self) {
        self.inner.close_idle_connections();
    }
}
