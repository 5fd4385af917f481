//! Market feed entry point.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_feed::api::{create_router, AppState};
use market_feed::config::Config;
use market_feed::feed::{FeedEvent, MarketFeed};
use market_feed::metrics;
use market_feed::service::FeedService;
use market_feed::utils::shutdown_signal;

/// Order book and candle feed.
#[derive(Parser, Debug)]
#[command(name = "market-feed")]
#[command(about = "Synchronizes streaming order books and aggregates trade candles")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true, env = "VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the feed and serve the HTTP API (default).
    Run {
        /// HTTP server port; overrides PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Feed a recorded message log through the pipeline offline.
    Replay {
        /// File with one raw transport message per line.
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("market_feed=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    // Handle subcommands
    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(),
        Some(Command::Replay { file }) => cmd_replay(&file).await,
        Some(Command::Run { port }) => cmd_run(port).await,
        None => cmd_run(None).await,
    }
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("MARKET FEED - CONFIGURATION CHECK");
    println!("======================================================================");

    // Load configuration
    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    // Validate configuration
    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    // Show configuration summary
    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Feed URL: {}", config.feed_ws_url);
    for channel in config.channel_keys()? {
        println!("  Channel: {} ({})", channel, channel.market_id());
    }
    println!("  Candle Intervals: {:?}s", config.candle_intervals);
    println!("  Book Depth Cap: {}", config.book_depth_cap);
    println!("  Book View Depth: {}", config.book_view_depth);
    println!("  Reconnect Max Delay: {}s", config.ws_reconnect_max_delay_s);
    println!("  Heartbeat Interval: {}s", config.ws_heartbeat_interval_s);
    println!("  HTTP Port: {}", config.port);
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Replay a recorded message log and print books and candles as JSON.
async fn cmd_replay(file: &Path) -> anyhow::Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    // Control messages have nowhere to go offline.
    let (control_tx, _control_rx) = mpsc::unbounded_channel();
    let mut service = FeedService::from_config(&config, control_tx, AppState::new())?;

    service.handle_event(FeedEvent::Connected);
    let mut lines = 0usize;
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        service.handle_message(line);
        lines += 1;
    }
    info!(lines = lines, "Replay finished");

    let books: serde_json::Map<String, serde_json::Value> = service
        .registry()
        .channels()
        .into_iter()
        .filter_map(|channel| {
            let view = service.registry().book(&channel)?;
            Some((channel.to_string(), serde_json::to_value(view).ok()?))
        })
        .collect();

    let output = serde_json::json!({
        "books": books,
        "candles": service.aggregator().all_candles(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Run the feed and the HTTP server until shutdown.
async fn cmd_run(port_override: Option<u16>) -> anyhow::Result<()> {
    // Load configuration
    info!("Loading configuration...");
    let mut config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    // Override with CLI args if provided
    if let Some(port) = port_override {
        config.port = port;
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    info!("Configuration loaded successfully");
    info!("Feed: {}", config.feed_ws_url);
    info!("Channels: {}", config.feed_channels.join(", "));
    info!("Candle intervals: {:?}", config.candle_intervals);

    // Initialize metrics
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;
    metrics::init_metrics();

    // Create app state
    let app_state = AppState::new().with_metrics(handle);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state.clone());

    // Spawn HTTP server
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // Wire transport and service
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let service = FeedService::from_config(&config, control_tx, app_state)?;

    let feed = Arc::new(MarketFeed::with_reconnect_config(
        config.feed_ws_url.clone(),
        config.reconnect_config(),
    ));
    let events = feed.clone().run_with_reconnect(control_rx);

    info!("========================================");
    info!("MARKET FEED STARTED");
    info!("========================================");

    tokio::select! {
        _ = service.run(events) => warn!("Feed ended"),
        _ = shutdown_signal() => {}
    }

    if feed.reconnect_attempts() > 0 {
        info!(attempts = feed.reconnect_attempts(), "Reconnect attempts since last connect");
    }

    match server_handle.await {
        Ok(Ok(())) => info!("HTTP server stopped"),
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    Ok(())
}
