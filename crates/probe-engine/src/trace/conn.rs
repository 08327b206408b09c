use super::Trace;
use crate::error::{FailureKind, NetError, Operation};
use crate::netx::{BoxedConn, Conn};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connection whose reads and writes are recorded as network events.
///
/// One event is emitted per completed `poll_read`/`poll_write`; the start
/// time is the first poll of that operation.
pub struct TracedConn {
    inner: BoxedConn,
    trace: Arc<Trace>,
    network: String,
    address: String,
    read_started: Option<Instant>,
    write_started: Option<Instant>,
}

impl TracedConn {
    #[must_use]
    pub fn new(inner: BoxedConn, trace: Arc<Trace>, network: &str, address: &str) -> Self {
        Self {
            inner,
            trace,
            network: network.to_string(),
            address: address.to_string(),
            read_started: None,
            write_started: None,
        }
    }

    fn record(
        &self,
        operation: Operation,
        count: Option<usize>,
        err: Option<NetError>,
        started: Instant,
    ) {
        self.trace.on_network_event(
            operation.as_str(),
            Some(&self.network),
            Some(&self.address),
            count,
            err.as_ref(),
            started,
            Instant::now(),
        );
    }
}

impl Conn for TracedConn {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }
}

impl AsyncRead for TracedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let started = *this.read_started.get_or_insert_with(Instant::now);
        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(outcome) = &res {
            this.read_started = None;
            let count = buf.filled().len() - before;
            match outcome {
                Ok(()) if count == 0 && had_room => this.record(
                    Operation::Read,
                    None,
                    Some(NetError::new(FailureKind::Eof, Operation::Read)),
                    started,
                ),
                Ok(()) => this.record(Operation::Read, Some(count), None, started),
                Err(e) => this.record(
                    Operation::Read,
                    None,
                    Some(NetError::new(FailureKind::from_io_error(e), Operation::Read)),
                    started,
                ),
            }
        }
        res
    }
}

impl AsyncWrite for TracedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let started = *this.write_started.get_or_insert_with(Instant::now);
        let res = Pin::new(&mut this.inner).poll_write(cx, data);
        if let Poll::Ready(outcome) = &res {
            this.write_started = None;
            match outcome {
                Ok(n) => this.record(Operation::Write, Some(*n), None, started),
                Err(e) => this.record(
                    Operation::Write,
                    None,
                    Some(NetError::new(FailureKind::from_io_error(e), Operation::Write)),
                    started,
                ),
            }
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
