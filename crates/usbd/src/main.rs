//! usbd entry point.
//!
//! Loads configuration, registers a logging subscriber (which starts the
//! uevent dispatch thread), publishes an initial snapshot and runs until
//! SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use typec_usbd::{
    EventSource, LoggingSink, NodeStore, SysfsNodeStore, UsbService, UsbdConfig,
    DEFAULT_CONFIG_PATH,
};

/// USB Type-C port coordination daemon
#[derive(Parser, Debug)]
#[command(name = "usbd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let chain = format!("{:#}", e);
            error!(error = %chain, "usbd exiting");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true).with_thread_names(true))
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = UsbdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("validating configuration")?;
    if args.check_config {
        info!(path = %args.config.display(), "Configuration is valid");
        return Ok(());
    }

    info!(
        typec_class = %config.paths.typec_class.display(),
        "Starting USB Type-C port coordination daemon"
    );

    let store: Arc<dyn NodeStore> = Arc::new(SysfsNodeStore::new());
    let source = event_source(&config);
    let service = UsbService::new(config, store, source);

    service
        .set_subscriber(Some(Arc::new(LoggingSink::new())))
        .context("registering subscriber")?;
    service.query_port_status(0);

    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Failed to send READY notification");
    }

    wait_for_shutdown().await?;
    info!("Shutting down");

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    service
        .set_subscriber(None)
        .context("clearing subscriber")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn event_source(config: &UsbdConfig) -> Arc<dyn EventSource> {
    Arc::new(typec_usbd::UeventSocket::new(config.uevent.receive_buffer_bytes))
}

#[cfg(not(target_os = "linux"))]
fn event_source(_config: &UsbdConfig) -> Arc<dyn EventSource> {
    warn!("Kernel uevents unavailable on this platform, using an idle event source");
    Arc::new(typec_usbd::ChannelEventSource::new())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for SIGINT")?,
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for SIGINT")?;
    Ok(())
}
