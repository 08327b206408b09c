//! probe-engine command line tool
//!
//! Drives the measurement engine from a shell: fetch URLs through the
//! policy-driven HTTPS dialer, run tasks, query test helpers and inspect
//! the persisted dialer statistics.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use probe_engine::control::{ControlRequest, control, discover_h3_server, find_test_helper};
use probe_engine::task::{ControlTaskRequest, QuicHandshakeRequest, TcpConnectRequest};
use probe_engine::{EngineConfig, Session, TaskRequest, logging, start_task};
use url::Url;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "probe-engine")]
#[command(about = "Network measurement engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `state_dir` from the configuration.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Overrides `log_level` from the configuration.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL through the engine's HTTP transport.
    Get {
        url: String,

        /// Print the response body as well.
        #[arg(long)]
        body: bool,
    },

    /// Run the TcpConnect task against an `ip:port` endpoint.
    TcpConnect {
        address: String,

        /// Milliseconds to wait for each event; negative waits forever.
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        wait_ms: i64,
    },

    /// Run the QuicHandshake task against an `ip:port` endpoint.
    QuicHandshake {
        address: String,

        /// SNI to send.
        #[arg(long, default_value = "")]
        sni: String,

        /// ALPN protocols to offer; `h3` when none is given.
        #[arg(long)]
        alpn: Vec<String>,

        /// Do not verify the server certificate.
        #[arg(long)]
        insecure: bool,

        /// Milliseconds to wait for each event; negative waits forever.
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        wait_ms: i64,
    },

    /// Ask a test helper what it sees for a URL.
    Control {
        /// Test helper URL; defaults to the first configured `https` helper.
        #[arg(long)]
        th_url: Option<String>,

        /// URL to measure.
        #[arg(long)]
        target: String,

        /// `ip:port` endpoints the helper should connect to.
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,

        /// `ip:port` endpoints the helper should QUIC-handshake with.
        #[arg(long = "quic-endpoint")]
        quic_endpoints: Vec<String>,

        /// Run through the task API instead of calling the helper directly.
        #[arg(long)]
        as_task: bool,
    },

    /// Print the persisted HTTPS dialer statistics.
    Stats,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }
    Ok(config)
}

/// Token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn get(session: &Session, cancel: &CancellationToken, url: &str, print_body: bool) -> Result<()> {
    let req = http::Request::get(url)
        .header(http::header::USER_AGENT, probe_engine::session::USER_AGENT)
        .body(Bytes::new())
        .with_context(|| format!("Invalid URL {url}"))?;
    let resp = session
        .network()
        .http_transport()
        .round_trip(cancel, req)
        .await
        .with_context(|| format!("GET {url} failed"))?;
    println!("{} {} bytes", resp.status(), resp.body().len());
    if print_body {
        println!("{}", String::from_utf8_lossy(resp.body()));
    }
    Ok(())
}

async fn run_task(request: TaskRequest, wait_ms: i64) -> Result<()> {
    let handle = start_task(request)?;
    let timeout = probe_engine::task::wait_timeout_from_millis(wait_ms);
    while !handle.is_done() {
        if let Some(ev) = handle.wait_for_next_event(timeout).await {
            println!("{}", serde_json::to_string(&ev)?);
        } else if timeout.is_some() && !handle.is_done() {
            warn!("no event within {wait_ms} ms, interrupting");
            handle.interrupt();
        }
    }
    Ok(())
}

async fn run_control(
    session: &Session,
    cancel: &CancellationToken,
    th_url: Option<String>,
    request: ControlRequest,
) -> Result<()> {
    let Some(th_url) = th_url.or_else(|| find_test_helper(session).map(|th| th.address)) else {
        bail!("No test helper given and none configured");
    };
    let target = Url::parse(&request.http_request)
        .with_context(|| format!("Invalid target URL {}", request.http_request))?;
    let resp = control(cancel, session, &th_url, &request)
        .await
        .context("Control request failed")?;
    let h3 = discover_h3_server(&resp.http_request, &target);
    let output = serde_json::json!({
        "th_url": th_url,
        "response": resp,
        "asns": resp.dns.asns,
        "h3": h3,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.log_level, cli.json_logs)?;

    let cancel = interrupt_token();
    let session = Session::from_config(config)?;
    info!(session_id = %session.id(), "probe-engine starting");

    let result = match cli.command {
        Commands::Get { url, body } => get(&session, &cancel, &url, body).await,
        Commands::TcpConnect { address, wait_ms } => {
            run_task(TaskRequest::TcpConnect(TcpConnectRequest { address }), wait_ms).await
        }
        Commands::QuicHandshake {
            address,
            sni,
            alpn,
            insecure,
            wait_ms,
        } => {
            let request = QuicHandshakeRequest {
                address,
                sni,
                alpn,
                insecure_skip_verify: insecure,
                timeout: Some(session.config().dial_config().quic_handshake_timeout),
            };
            run_task(TaskRequest::QuicHandshake(request), wait_ms).await
        }
        Commands::Control {
            th_url,
            target,
            endpoints,
            quic_endpoints,
            as_task,
        } => {
            let request = ControlRequest {
                http_request: target,
                tcp_connect: endpoints,
                quic_handshake: quic_endpoints,
                ..ControlRequest::default()
            };
            if as_task {
                let test_helpers = session
                    .config()
                    .test_helpers
                    .get(probe_engine::control::WEB_CONNECTIVITY_HELPER)
                    .cloned()
                    .unwrap_or_default();
                let args = ControlTaskRequest {
                    th_url,
                    test_helpers,
                    asn_database: session.config().asn_database.clone(),
                    request,
                };
                let wait_ms = i64::try_from(
                    (session.config().control_timeout + Duration::from_secs(5)).as_millis(),
                )
                .unwrap_or(-1);
                run_task(TaskRequest::Control(args), wait_ms).await
            } else {
                run_control(&session, &cancel, th_url, request).await
            }
        }
        Commands::Stats => {
            let snapshot = session.network().stats().snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    };

    // Persist statistics even when the command failed.
    if let Err(e) = session.close() {
        warn!(error = %e, "failed to persist dialer statistics");
    }
    result
}
