//! vendo-daemon - coin/voucher WiFi vending gateway.
//!
//! Composition root: loads the frozen configuration, opens the session
//! store, wires the engine, replays enforcement for every active user,
//! then runs the background loops until SIGINT/SIGTERM.
//!
//! The portal HTTP/WebSocket layer is a separate process that links
//! [`vendo_daemon::portal::PortalService`]; this binary serves only the
//! operational endpoints (`/metrics`, `/healthz`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vendo_core::policy::PacketPolicy;
use vendo_core::{GatewayConfig, SessionStore};
use vendo_daemon::idle::IdleMonitor;
use vendo_daemon::metrics::{GatewayMetrics, SharedMetrics};
use vendo_daemon::policy::{InMemoryPolicy, NetfilterPolicy};
use vendo_daemon::state::Gateway;
use vendo_daemon::ticker::Ticker;
use vendo_daemon::{enforce, portal::PortalService};

/// vendo gateway daemon
#[derive(Parser, Debug)]
#[command(name = "vendo-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "vendo.toml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Port for the metrics/health HTTP endpoint
    #[arg(long, default_value = "9464")]
    metrics_port: u16,

    /// Disable the metrics/health HTTP endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Use the in-memory packet policy instead of netfilter (no root,
    /// nothing enforced; for bring-up on a workstation)
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let mut cfg = if args.config.exists() {
        GatewayConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        warn!(path = %args.config.display(), "config file missing; using defaults");
        GatewayConfig::default()
    };
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }
    if cfg.db_path.as_os_str().is_empty() {
        cfg.db_path = PathBuf::from("vendo.db");
    }
    if cfg.lan_iface.is_empty() {
        cfg.lan_iface = "br-lan".to_string();
    }

    let store = SessionStore::open(&cfg.db_path).context("failed to open session store")?;
    let metrics = GatewayMetrics::new_shared().context("failed to register metrics")?;

    let policy: Arc<dyn PacketPolicy> = if args.dry_run {
        warn!("dry run: packet policy is in-memory, nothing is enforced");
        Arc::new(InMemoryPolicy::new())
    } else {
        let netfilter = NetfilterPolicy::new(cfg.lan_iface.clone(), &cfg.policy);
        if let Err(err) = netfilter.ensure_plumbing().await {
            // The ticker reconcile pass re-drives everything once the
            // tools come back, so a failed bootstrap is not fatal.
            warn!(%err, "netfilter plumbing bootstrap failed");
        }
        Arc::new(netfilter)
    };

    let (enforce_tx, enforce_rx) = enforce::channel();
    let gateway = Gateway::new(cfg, store, policy.clone(), enforce_tx, metrics.clone())
        .context("failed to compose gateway")?;

    // Re-authorize survivors before anything else touches the plane.
    gateway
        .startup_recovery()
        .await
        .map_err(|e| anyhow::anyhow!("startup recovery failed: {e}"))?;

    let _portal = PortalService::new(gateway.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let outbox = tokio::spawn(enforce::run_outbox(enforce_rx, policy, metrics.clone()));
    let ticker = tokio::spawn(Ticker::new(gateway.clone()).run(shutdown_rx.clone()));
    let idle = tokio::spawn(IdleMonitor::new(gateway.clone()).run(shutdown_rx.clone()));

    let metrics_server = if args.no_metrics {
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
        Some(tokio::spawn(serve_metrics(addr, metrics.clone(), shutdown_rx)))
    };

    info!("vendo gateway running");
    wait_for_signal().await;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();
    drop(_portal);

    if let Err(err) = ticker.await {
        error!(%err, "ticker task panicked");
    }
    if let Err(err) = idle.await {
        error!(%err, "idle monitor task panicked");
    }
    drop(gateway);
    if let Err(err) = outbox.await {
        error!(%err, "enforcement outbox task panicked");
    }
    if let Some(server) = metrics_server {
        server.abort();
    }
    info!("vendo gateway stopped");
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

async fn serve_metrics(
    addr: SocketAddr,
    metrics: SharedMetrics,
    mut shutdown: watch::Receiver<bool>,
) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(metrics);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "failed to bind metrics endpoint");
            return;
        },
    };
    info!(%addr, "metrics endpoint listening");
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(err) = server.await {
        error!(%err, "metrics server error");
    }
}

async fn metrics_handler(State(metrics): State<SharedMetrics>) -> Result<String, StatusCode> {
    metrics
        .encode_text()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
