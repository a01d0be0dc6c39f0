//! Round keeper service: drives daily up/down rounds and streams their
//! events to clients.

use anyhow::{Context, Result};
use clap::Parser;
use predict_rounds::{
    app::{shutdown_signal, Services, SHUTDOWN_GRACE},
    config::AppConfig,
    logging::init_tracing,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rounds-keeper")]
#[command(about = "Daily up/down prediction round keeper")]
struct Args {
    /// HTTP port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Do not start background jobs (overrides ENABLE_JOBS)
    #[arg(long, default_value = "false")]
    no_jobs: bool,

    /// Run a single round tick, print its report and exit
    #[arg(long, default_value = "false")]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::from_env()?;
    init_tracing(&config.log_format);

    if let Some(port) = args.port {
        config.port = port;
    }
    if args.no_jobs {
        config.enable_jobs = false;
    }

    info!(
        port = config.port,
        oracle = ?config.oracle_mode,
        lock_after = ?config.round_lock_after,
        end_after = ?config.round_end_after,
        "rounds keeper starting"
    );

    let services = Services::build(config).await?;

    if args.once {
        services.jobs.run_price_tick().await?;
        let report = services.scheduler.tick().await;
        info!(?report, "single tick complete");
        return Ok(());
    }

    let _relay = services
        .oracle
        .take_events()
        .map(|rx| services.broadcaster.spawn_oracle_relay(rx));

    let job_handles = if services.config.enable_jobs {
        services.jobs.start()
    } else {
        warn!("background jobs disabled; rounds will not advance");
        Vec::new()
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], services.config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, keeper = services.scheduler.instance_id(), "listening");

    axum::serve(listener, services.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.jobs.shutdown();
    for handle in job_handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("job did not stop within grace period");
        }
    }
    info!("rounds keeper stopped");
    Ok(())
}
