// CIP daemon: host (accept clients) or client (dial a host), sharing one signal table.

use std::sync::Arc;

use anyhow::Context;
use cip_core::{Joins, Signal, Transition};
use cip_linux::config::{self, Config, Mode};
use cip_linux::{accept_with_joins, dial_with_joins};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("cip-linux {}", VERSION);
            return Ok(());
        }
    }

    init_tracing();
    let cfg = config::load();
    info!(?cfg, "starting");

    let joins = Arc::new(Joins::new());
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::spawn(log_inbound(joins.clone()));
        let cfg_run = cfg.clone();
        let joins_run = joins.clone();
        let service = tokio::spawn(async move {
            match cfg_run.role {
                Mode::Host => run_host(cfg_run, joins_run).await,
                Mode::Client => run_client(cfg_run, joins_run).await,
            }
        });
        tokio::select! {
            r = service => r.context("service task panicked")??,
            r = shutdown_signal() => r?,
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Accept clients forever; each one is served against the shared joins.
async fn run_host(cfg: Config, joins: Arc<Joins>) -> anyhow::Result<()> {
    let endpoint = cfg.endpoint();
    let listener = TcpListener::bind(&endpoint)
        .await
        .with_context(|| format!("binding {}", endpoint))?;
    info!(%endpoint, "listening for CIP clients");
    loop {
        match accept_with_joins(&listener, joins.clone(), cfg.connection_config()).await {
            Ok(conn) => {
                tokio::spawn(async move {
                    conn.closed().await;
                    match conn.last_error() {
                        Some(e) => warn!(peer = ?conn.peer_addr(), error = %e, "client dropped"),
                        None => info!(peer = ?conn.peer_addr(), "client disconnected"),
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

/// Dial the host, and redial after the configured delay whenever the link drops.
async fn run_client(cfg: Config, joins: Arc<Joins>) -> anyhow::Result<()> {
    let endpoint = cfg.endpoint();
    loop {
        match dial_with_joins("tcp", &endpoint, cfg.ipid, joins.clone(), cfg.connection_config())
            .await
        {
            Ok(conn) => {
                conn.closed().await;
                match conn.last_error() {
                    Some(e) => warn!(error = %e, status = %conn, "link lost"),
                    None => info!("host closed the link"),
                }
            }
            Err(e @ cip_linux::ConnectionError::InvalidIpid(_)) => return Err(e.into()),
            Err(e) => warn!(%endpoint, error = %e, "dial failed"),
        }
        tokio::time::sleep(cfg.reconnect_delay()).await;
    }
}

async fn log_inbound(joins: Arc<Joins>) {
    let mut rx = joins.subscribe_inbound();
    loop {
        match rx.recv().await {
            Ok(Transition { join, signal }) => match signal {
                Signal::Digital(v) => info!(%join, value = v, "digital in"),
                Signal::Analog(v) => info!(%join, value = v, "analog in"),
                Signal::Serial(v) => info!(%join, len = v.len(), "serial in"),
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "inbound log fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutting down");
    Ok(())
}
