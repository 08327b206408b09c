//! Network measurement engine
//!
//! This crate provides the networking core used by censorship measurement
//! experiments, including:
//!
//! - **Traced dialing**: TCP, TLS and QUIC operations wrapped so that every
//!   connect, handshake, read and write lands in a bounded archival buffer
//! - **Policy-driven HTTPS dialing**: tactics (IP, SNI, verify hostname)
//!   ranked by persisted success statistics and tried in order
//! - **Control protocol**: asks a test helper what it sees for a URL and
//!   enriches the reply with ASN data
//! - **Task API**: starts named tasks and streams their events to the host
//!   application through a bounded channel
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           Session                                    │
//! │   config · kvstore · ASN database · engine network · byte counter    │
//! └──────────────┬──────────────────────────────────────┬───────────────┘
//!                │                                      │
//!                ▼                                      ▼
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │       enginenetx::Network     │        │       control / httpx         │
//! │  HttpsDialer ◄── policy       │        │  POST ControlRequest to the   │
//! │       │          ▲            │        │  test helper, fill ASNs       │
//! │       │          │ stats      │        └──────────────────────────────┘
//! │       ▼          │ (kvstore)  │
//! │  EngineHttpTransport          │        ┌──────────────────────────────┐
//! └──────────────┬───────────────┘        │            trace              │
//!                │                         │  DialerTrace · TracedConn     │
//!                ▼                         │  TlsHandshakerTrace           │
//! ┌──────────────────────────────┐        │  QuicDialerTrace              │
//! │            netx               │◄───────┤  bounded archival buffers     │
//! │  Dialer · TlsHandshaker       │        └──────────────────────────────┘
//! │  QuicDialer · Resolver        │
//! └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Fetch a URL through the policy-driven HTTPS dialer
//! probe-engine get https://example.com/
//!
//! # Run the TcpConnect task and print its events
//! probe-engine tcp-connect 93.184.216.34:443
//!
//! # QUIC handshake with an endpoint, offering h3
//! probe-engine quic-handshake 93.184.216.34:443 --sni example.com
//!
//! # Ask a test helper about a URL
//! probe-engine control --th-url https://th.example.org/ --target https://example.com/
//!
//! # Show persisted HTTPS dialer statistics
//! probe-engine stats
//! ```

pub mod config;
pub mod control;
pub mod enginenetx;
pub mod error;
pub mod httpx;
pub mod kvstore;
pub mod logging;
pub mod model;
pub mod netx;
pub mod session;
pub mod task;
pub mod trace;

pub use config::EngineConfig;
pub use enginenetx::Network;
pub use error::{FailureKind, NetError, Operation};
pub use session::{ExperimentSession, Session};
pub use task::{TaskEvent, TaskHandle, TaskRequest, start_task};
pub use trace::Trace;
