use std::str::FromStr;

use eyre::WrapErr;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::{arguments, watchdog::Watchdog};
use crate::config::WatchdogdConfig;

/// Exit code for fatal conditions the process must not restart from.
const EXIT_FATAL: i32 = 3;

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = WatchdogdConfig::from_path(args.config)?;

    init_logging(&config.log_level)?;

    let watchdog = Watchdog::new(config)?;
    watchdog.run().await?;

    shutdown_requested(&watchdog).await;
    watchdog.shutdown().await;

    if watchdog.is_fatal() {
        std::process::exit(EXIT_FATAL);
    }

    Ok(())
}

/// Install the global tracing subscriber.
///
/// The configured level is the default for every target; `RUST_LOG`
/// directives refine it without touching the configuration file.
fn init_logging(configured: &str) -> eyre::Result<()> {
    let level = Level::from_str(configured)
        .wrap_err_with(|| format!("\"{}\" is not a log level", configured))?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env()
        .wrap_err("invalid RUST_LOG directive")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// Resolve once the watchdog should come down: one of its services hit a
/// terminal condition, or the operator asked us to stop.
async fn shutdown_requested(watchdog: &Watchdog) {
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut sigquit = signal(SignalKind::quit()).expect("SIGQUIT handler");

    tokio::select! {
        _ = watchdog.cancelled() => info!("a watchdog service stopped, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
    }
}
