//! Entry point for the matchforge match lifecycle service

use anyhow::{Context, Result};
use clap::Parser;
use matchforge::config::{validate_config, AppConfig};
use matchforge::provider::{GameServerProvider, MockGameServerProvider};
use matchforge::service::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Matchforge - competitive match lifecycle and settlement engine
#[derive(Parser)]
#[command(
    name = "matchforge",
    version,
    about = "Queueing, veto, server provisioning and settlement for 1v1/5v5 matches"
)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override AMQP connection URL
    #[arg(long, value_name = "URL")]
    amqp_url: Option<String>,

    /// Override health and metrics port
    #[arg(long, value_name = "PORT")]
    health_port: Option<u16>,

    /// Use the in-process game server provider instead of the HTTP API
    #[arg(long)]
    mock_provider: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit without starting the service
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Config file or environment, then CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }
    if args.debug {
        config.service.log_level = "debug".to_string();
    }
    if let Some(url) = &args.amqp_url {
        config.amqp.url = url.clone();
    }
    if let Some(port) = args.health_port {
        config.service.health_port = port;
    }

    validate_config(&config).context("Invalid configuration after CLI overrides")?;
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("Matchforge {}", env!("CARGO_PKG_VERSION"));
    info!("   Service: {}", config.service.name);
    info!("   Health port: {}", config.service.health_port);
    info!("   Command queue: {}", config.amqp.command_queue);
    info!("   Provider: {}", config.provider.base_url);
    info!(
        "   Timeouts: confirm {}s, warmup {}s",
        config.lifecycle.confirmation_timeout_seconds, config.lifecycle.warmup_timeout_seconds
    );
    info!("   Platform fee: {} bps", config.wager.platform_fee_bps);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    display_startup_banner(&config);
    if args.dry_run {
        info!("Configuration is valid; exiting");
        return Ok(());
    }

    let shutdown_timeout = config.shutdown_timeout();
    let app_state = if args.mock_provider {
        warn!("Using the in-process game server provider");
        let provider: Arc<dyn GameServerProvider> = Arc::new(MockGameServerProvider::new());
        AppState::with_provider(config, provider).await
    } else {
        AppState::new(config).await
    };
    let mut app_state = match app_state {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start: {}", e);
        let _ = app_state.shutdown().await;
        std::process::exit(1);
    }

    info!("Matchforge is running; press Ctrl+C to stop");
    wait_for_shutdown_signal().await;

    match tokio::time::timeout(shutdown_timeout, app_state.shutdown()).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => error!("Shutdown failed: {}", e),
        Err(_) => warn!("Shutdown timed out after {:?}", shutdown_timeout),
    }
    Ok(())
}
