//! poly-relay: signal-following execution agent.
//!
//! Usage:
//!   poly-relay [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Config file path (default: config/relay.toml)
//!   --host <HOST>         Event stream host (overrides config)
//!   --port <PORT>         Event stream port (overrides config)
//!   --channel <CHANNEL>   Event stream channel (overrides config)
//!   --market <SLUG>       Market to bind at startup (overrides config)
//!
//! Credentials come from the environment: RELAY_STREAM_TOKEN for the
//! stream, RELAY_API_KEY for the exchange.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use poly_relay::config::RelayConfig;
use poly_relay::consumer::EventConsumer;
use poly_relay::coordinator::MarketCoordinator;
use poly_relay::exchange::ClobClient;
use poly_relay::executor::ExecutionEngine;
use poly_relay::pipeline::Pipeline;
use poly_relay::price_feed::{ClobPriceFeed, NoopPriceFeed, PriceFeed};
use poly_relay::resolver::GammaResolver;
use poly_relay::types::BindSource;

/// CLI arguments for poly-relay.
#[derive(Parser, Debug)]
#[command(name = "poly-relay")]
#[command(about = "Signal-following execution agent for Polymarket binary markets")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/relay.toml")]
    config: PathBuf,

    /// Event stream host (overrides config file)
    #[arg(long)]
    host: Option<String>,

    /// Event stream port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    /// Event stream channel (overrides config file)
    #[arg(long)]
    channel: Option<String>,

    /// Market slug to bind at startup (overrides config file)
    #[arg(long)]
    market: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        RelayConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        RelayConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(args.host, args.port, args.channel, args.market);

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    config.validate().context("Configuration validation failed")?;

    info!("Starting poly-relay");
    info!(
        host = %config.stream.host,
        port = config.stream.port,
        channel = %config.stream.channel,
        "Event stream target"
    );

    let (shutdown_tx, _) = broadcast::channel(16);

    // Wire the components. The exchange and resolver are the only pieces
    // that talk to the outside world besides the stream itself.
    let api_key = config
        .execution
        .api_key
        .clone()
        .context("exchange API key missing after validation")?;
    let exchange = Arc::new(
        ClobClient::new(config.execution.clob_url.clone(), api_key)
            .context("Failed to create exchange client")?,
    );
    let executor = Arc::new(ExecutionEngine::new(
        exchange,
        config.execution.shares_per_trade,
    ));

    let resolver = Arc::new(
        GammaResolver::new(config.market.gamma_url.clone())
            .context("Failed to create market resolver")?,
    );

    let price_feed: Arc<dyn PriceFeed> = if config.feed.enabled {
        Arc::new(ClobPriceFeed::spawn(config.feed.ws_url.clone(), &shutdown_tx))
    } else {
        Arc::new(NoopPriceFeed)
    };

    let coordinator = Arc::new(MarketCoordinator::new(
        resolver,
        executor.clone(),
        price_feed,
        shutdown_tx.clone(),
        Duration::from_millis(config.market.resolve_retry_delay_ms),
    ));

    // Bind the default market before consuming, so signals that arrive
    // ahead of the first MARKET_CONFIG have something to trade on.
    if let Some(slug) = &config.market.default_slug {
        if let Err(e) = coordinator.bind(slug, BindSource::Boot).await {
            error!(slug = %slug, "Default market bind interrupted: {}", e);
            return Ok(());
        }
    }

    let pipeline = Pipeline::new(
        coordinator.clone(),
        executor.clone(),
        config.stream.max_signal_age_ms,
    );
    let consumer = EventConsumer::spawn(config.stream_target(), pipeline, &shutdown_tx);

    // Status loop until a shutdown signal arrives.
    let mut status_ticker =
        tokio::time::interval(Duration::from_secs(config.status_interval_secs));
    status_ticker.tick().await;
    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                report_status(&consumer, &executor, &coordinator).await;
            }
            result = wait_for_shutdown() => {
                if let Err(e) = result {
                    error!("Shutdown signal handler error: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(());
    consumer.join().await;
    report_status_final(&executor).await;
    Ok(())
}

/// Periodic one-line health report.
async fn report_status(
    consumer: &EventConsumer,
    executor: &ExecutionEngine,
    coordinator: &MarketCoordinator,
) {
    let stats = consumer.stats();
    let exec = executor.stats();
    let market = coordinator.active_market().await;
    info!(
        state = %stats.state,
        stream = %format!(
            "{}:{}/{}",
            stats.target.host, stats.target.port, stats.target.channel
        ),
        market = %market.as_ref().map(|m| m.slug.as_str()).unwrap_or("<none>"),
        received = stats.received,
        processed = stats.processed_ok,
        stale = stats.stale,
        rejected = stats.failed,
        orders_sent = exec.sent,
        orders_failed = exec.failed,
        orders_skipped = exec.skipped,
        last_signal = %stats.last_signal.as_deref().unwrap_or("<none>"),
        last_order = %exec.last_order.as_deref().unwrap_or("<none>"),
        "Status"
    );
    if stats.state != poly_relay::consumer::ConnState::Subscribed {
        warn!(state = %stats.state, "Event stream is not subscribed");
    }
}

async fn report_status_final(executor: &ExecutionEngine) {
    let exec = executor.stats();
    let ledger = executor.ledger().await;
    info!(
        orders_sent = exec.sent,
        orders_failed = exec.failed,
        orders_skipped = exec.skipped,
        held_up = %ledger.up,
        held_down = %ledger.down,
        "Final totals"
    );
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
