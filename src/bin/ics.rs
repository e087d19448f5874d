//! Process entry point: parses CLI flags, loads configuration, launches the
//! worker pool, serves the admin HTTP surface, and exits gracefully on
//! `SIGTERM`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use ics::admin::{server as admin_server, AdminState};
use ics::config::{CliArgs, ProcessEnv, WatchdogConfig};
use ics::logging;
use ics::monitor::{IntervalMonitor, LatencyReporter};
use ics::profiler::Profiler;
use ics::proxy::Server as ProxyServer;
use ics::scheduler::Scheduler;
use ics::version;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();
    if cli.version {
        version::print_version();
        return Ok(());
    }

    logging::init();

    let config = Arc::new(WatchdogConfig::read(&ProcessEnv).context("loading configuration")?);

    let admin_port = if cli.port != 0 { cli.port } else { config.admin_port };

    let lock_path = lock_file_path();
    if !config.suppress_lock {
        tokio::fs::write(&lock_path, b"")
            .await
            .context("creating lock file")?;
    }

    let proxy_addr: std::net::SocketAddr = format!("127.0.0.1:{}", config.port)
        .parse()
        .expect("formatted loopback address is always valid");
    let proxy = ProxyServer::new(proxy_addr, config.debug_headers, true);

    let monitor = IntervalMonitor::new(None);
    let latency = Arc::new(LatencyReporter::new());
    latency.pipe_from(proxy.serving_feed());

    let profiler = match &config.profile {
        Some(path) => Some(Arc::new(
            Profiler::open(path.clone()).await.context("opening profile file")?,
        )),
        None => None,
    };

    let scheduler = Scheduler::new(config.clone(), proxy.clone(), monitor.clone(), latency, profiler);
    scheduler
        .launch_pool()
        .context("launching worker pool")?;
    monitor.start();

    if let Some(specialize) = cli.specialize.clone().or_else(|| config.faas.clone()) {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            match scheduler.serve(specialize.clone()).await_result().await {
                Ok(()) => info!(function = %specialize, "served function at boot"),
                Err(e) => warn!(function = %specialize, error = %e, "failed to serve function at boot"),
            }
        });
    }

    let admin_state = AdminState::new(scheduler.clone(), lock_path.clone());
    let admin_addr: std::net::SocketAddr = format!("127.0.0.1:{admin_port}")
        .parse()
        .expect("formatted loopback address is always valid");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin_state_for_server = admin_state.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server::serve(admin_state_for_server, admin_addr, shutdown_rx).await {
            warn!(error = %e, "admin server exited with error");
        }
    });

    scheduler.record_profile("admin_start").await;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    sigterm.recv().await;
    info!("received SIGTERM, shutting down");

    admin_state.stop_accepting();
    let _ = tokio::fs::remove_file(&lock_path).await;
    tokio::time::sleep(config.write_timeout).await;

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(config.write_timeout).await;

    proxy.close();
    let _ = admin_handle.await;

    Ok(())
}

fn lock_file_path() -> PathBuf {
    std::env::temp_dir().join(".lock")
}
