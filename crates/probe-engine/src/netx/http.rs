//! HTTP/1.1 transport over engine-provided connections.

use super::{Dialer, TlsDialer, join_host_port};
use crate::error::{FailureKind, NetError, Operation};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sends HTTP requests and returns fully buffered responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn round_trip(
        &self,
        cancel: &CancellationToken,
        req: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, NetError>;

    /// Drop pooled connections and those of the underlying dialers.
    fn close_idle_connections(&self);
}

fn round_trip_error(kind: FailureKind) -> NetError {
    NetError::new(kind, Operation::HttpRoundTrip)
}

fn classify_hyper_error(err: hyper::Error) -> NetError {
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            let kind = FailureKind::from_io_error(io_err);
            return round_trip_error(kind).with_source(err);
        }
        source = inner.source();
    }
    let kind = if err.is_timeout() {
        FailureKind::GenericTimeout
    } else if err.is_incomplete_message() {
        FailureKind::Eof
    } else {
        FailureKind::HttpRequestFailed
    };
    round_trip_error(kind).with_source(err)
}

/// HTTP/1.1 transport keeping one idle pool per `scheme://host:port`.
///
/// `http` URLs use the plain dialer; `https` URLs go through the TLS dialer,
/// which is where tactic selection happens.
pub struct EngineHttpTransport {
    dialer: Arc<dyn Dialer>,
    tls_dialer: Arc<dyn TlsDialer>,
    idle: Mutex<HashMap<String, Vec<SendRequest<Full<Bytes>>>>>,
}

impl EngineHttpTransport {
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>, tls_dialer: Arc<dyn TlsDialer>) -> Self {
        Self {
            dialer,
            tls_dialer,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Number of pooled connections across all origins.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        match self.idle.lock() {
            Ok(pool) => pool.values().map(Vec::len).sum(),
            Err(_) => 0,
        }
    }

    fn take_idle(&self, key: &str) -> Option<SendRequest<Full<Bytes>>> {
        let mut pool = self.idle.lock().ok()?;
        let senders = pool.get_mut(key)?;
        while let Some(sender) = senders.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    fn put_idle(&self, key: String, sender: SendRequest<Full<Bytes>>) {
        if sender.is_closed() {
            return;
        }
        match self.idle.lock() {
            Ok(mut pool) => pool.entry(key).or_default().push(sender),
            Err(_) => warn!("BUG: idle pool lock poisoned"),
        }
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        https: bool,
        endpoint: &str,
    ) -> Result<SendRequest<Full<Bytes>>, NetError> {
        let conn = if https {
            self.tls_dialer.dial_tls(cancel, endpoint).await?
        } else {
            self.dialer.dial(cancel, "tcp", endpoint).await?
        };
        let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(conn))
            .await
            .map_err(classify_hyper_error)?;
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(%endpoint, error = %e, "http connection ended with error");
            }
        });
        Ok(sender)
    }
}

#[async_trait]
impl HttpTransport for EngineHttpTransport {
    async fn round_trip(
        &self,
        cancel: &CancellationToken,
        req: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, NetError> {
        let (mut parts, body) = req.into_parts();
        let https = match parts.uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(round_trip_error(FailureKind::Unknown(format!(
                    "unsupported scheme: {}",
                    other.unwrap_or("")
                ))));
            }
        };
        let Some(host) = parts.uri.host().map(|h| h.trim_matches(['[', ']']).to_string()) else {
            return Err(round_trip_error(FailureKind::Unknown(
                "missing host in URL".to_string(),
            )));
        };
        let port = parts.uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let endpoint = join_host_port(&host, &port.to_string());
        let pool_key = format!("{}://{endpoint}", if https { "https" } else { "http" });

        if !parts.headers.contains_key(HOST) {
            let authority = parts.uri.authority().map_or(host.as_str(), |a| a.as_str());
            let value = HeaderValue::from_str(authority).map_err(|e| {
                round_trip_error(FailureKind::Unknown(e.to_string()))
            })?;
            parts.headers.insert(HOST, value);
        }
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |p| p.as_str())
            .to_string();
        parts.uri = path
            .parse()
            .map_err(|e: http::uri::InvalidUri| round_trip_error(FailureKind::Unknown(e.to_string())))?;
        let request = http::Request::from_parts(parts, Full::new(body));

        let fut = async {
            let mut sender = match self.take_idle(&pool_key) {
                Some(mut idle) => match idle.ready().await {
                    Ok(()) => idle,
                    Err(_) => self.connect(cancel, https, &endpoint).await?,
                },
                None => self.connect(cancel, https, &endpoint).await?,
            };
            debug!(%pool_key, method = %request.method(), "http round trip");
            let response = sender
                .send_request(request)
                .await
                .map_err(classify_hyper_error)?;
            let (parts, incoming) = response.into_parts();
            let body = incoming
                .collect()
                .await
                .map_err(classify_hyper_error)?
                .to_bytes();
            self.put_idle(pool_key.clone(), sender);
            Ok(http::Response::from_parts(parts, body))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NetError::interrupted(Operation::HttpRoundTrip)),
            res = fut => res,
        }
    }

    fn close_idle_connections(&self) {
        match self.idle.lock() {
            Ok(mut pool) => pool.clear(),
            Err(_) => warn!("BUG: idle pool lock poisoned"),
        }
        self.dialer.close_idle_connections();
        self.tls_dialer.close_idle_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netx::{BoxedConn, TcpDialer};
    use axum::{Router, routing::get};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct RefusingTlsDialer {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl TlsDialer for RefusingTlsDialer {
        async fn dial_tls(
            &self,
            _cancel: &CancellationToken,
            _address: &str,
        ) -> Result<BoxedConn, NetError> {
            Err(NetError::new(
                FailureKind::ConnectionRefused,
                Operation::Connect,
            ))
        }

        fn close_idle_connections(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn serve() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/hello", get(|| async { "hello, world" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn transport() -> (EngineHttpTransport, Arc<RefusingTlsDialer>) {
        let tls = Arc::new(RefusingTlsDialer {
            closed: AtomicUsize::new(0),
        });
        (
            EngineHttpTransport::new(Arc::new(TcpDialer::default()), tls.clone()),
            tls,
        )
    }

    #[tokio::test]
    async fn test_get_and_reuse_connection() {
        let addr = serve().await;
        let (txp, tls) = transport();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let req = http::Request::get(format!("http://{addr}/hello"))
                .body(Bytes::new())
                .unwrap();
            let resp = txp.round_trip(&cancel, req).await.unwrap();
            assert_eq!(resp.status(), 200);
            assert_eq!(resp.body().as_ref(), b"hello, world");
        }
        assert_eq!(txp.idle_connections(), 1);

        txp.close_idle_connections();
        assert_eq!(txp.idle_connections(), 0);
        assert_eq!(tls.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_https_uses_tls_dialer() {
        let (txp, _) = transport();
        let req = http::Request::get("https://example.com/")
            .body(Bytes::new())
            .unwrap();
        let err = txp
            .round_trip(&CancellationToken::new(), req)
            .await
            .unwrap_err();
        assert_eq!(err.failure(), "connection_refused");
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let (txp, _) = transport();
        let req = http::Request::get("ftp://example.com/")
            .body(Bytes::new())
            .unwrap();
        let err = txp
            .round_trip(&CancellationToken::new(), req)
            .await
            .unwrap_err();
        assert!(err.failure().starts_with("unknown_failure"));
    }

    #[tokio::test]
    async fn test_cancelled_round_trip() {
        let addr = serve().await;
        let (txp, _) = transport();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = http::Request::get(format!("http://{addr}/hello"))
            .body(Bytes::new())
            .unwrap();
        let err = txp.round_trip(&cancel, req).await.unwrap_err();
        assert!(err.is_interrupted());
    }
}
