//! Minimal JSON-over-HTTP client.

use crate::error::{FailureKind, NetError, Operation};
use crate::netx::HttpTransport;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum HttpxError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[from] NetError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status code: {0}")]
    Status(u16),
    #[error("cannot encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl HttpxError {
    /// Classify into a network failure of the given operation.
    #[must_use]
    pub fn into_net_error(self, operation: Operation) -> NetError {
        let kind = match &self {
            Self::InvalidUrl(detail) => FailureKind::Unknown(detail.clone()),
            Self::Transport(e) => e.kind().clone(),
            Self::Timeout(_) => FailureKind::GenericTimeout,
            Self::Status(_) => FailureKind::HttpRequestFailed,
            Self::Json(_) => FailureKind::JsonParse,
        };
        NetError::new(kind, operation).with_source(self)
    }
}

/// Talks JSON to a single base URL over an engine transport.
#[derive(Clone)]
pub struct HttpxClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    user_agent: String,
    timeout: Option<Duration>,
}

impl HttpxClient {
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            user_agent: user_agent.into(),
            timeout: None,
        }
    }

    /// Bound the duration of every request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn url(&self, resource_path: &str) -> Result<Url, HttpxError> {
        let base = Url::parse(&self.base_url).map_err(|e| HttpxError::InvalidUrl(e.to_string()))?;
        base.join(resource_path)
            .map_err(|e| HttpxError::InvalidUrl(e.to_string()))
    }

    /// POST `input` as JSON to `resource_path` and decode a JSON reply.
    pub async fn post_json<I, O>(
        &self,
        cancel: &CancellationToken,
        resource_path: &str,
        input: &I,
    ) -> Result<O, HttpxError>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let url = self.url(resource_path)?;
        let body = Bytes::from(serde_json::to_vec(input)?);
        let req = http::Request::post(url.as_str())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|e| HttpxError::InvalidUrl(e.to_string()))?;
        debug!(%url, "httpx POST");

        let round_trip = self.transport.round_trip(cancel, req);
        let resp = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, round_trip)
                .await
                .map_err(|_| HttpxError::Timeout(timeout))??,
            None => round_trip.await?,
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpxError::Status(status.as_u16()));
        }
        Ok(serde_json::from_slice(resp.body())?)
    }
}
