//! Orchestration server binary: loads configuration, builds the daemon,
//! binds the API listener, and serves until ctrl-c.

use anyhow::{Context, Result};
use ao_core::config::Config;
use ao_server::daemon::Daemon;
use tokio::net::TcpListener;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    ao_telemetry::logging::init_logging("ao-server", "info");

    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        "orchestrator starting"
    );

    let daemon = Daemon::new(config).await.context("failed to initialize daemon")?;

    let bind_addr = format!("{}:{}", daemon.config().host, daemon.config().port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let bound_addr = listener.local_addr()?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    info!(%bound_addr, "ready");
    daemon.run_with_listener(listener).await?;

    info!("orchestrator stopped");
    Ok(())
}
