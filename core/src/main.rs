use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use warren::{BrokerConfig, BrokerServer, Result};

#[derive(Parser, Debug)]
#[command(name = "warren")]
#[command(about = "An AMQP-0-9-1-style message broker written in Rust")]
struct Args {
    /// Overrides WARREN_HOST
    #[arg(long)]
    host: Option<String>,

    /// Overrides WARREN_PORT
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Persist messages under this directory; in-memory when omitted
    #[arg(long)]
    data_dir: Option<String>,

    #[arg(long)]
    max_channels: Option<u16>,

    /// Outstanding unacked bytes per consumer
    #[arg(long)]
    consumer_budget: Option<u64>,

    #[arg(long)]
    persist_interval_ms: Option<u64>,
}

impl Args {
    fn apply(self, mut config: BrokerConfig) -> BrokerConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if let Some(max_channels) = self.max_channels {
            config.max_channels = max_channels;
        }
        if let Some(budget) = self.consumer_budget {
            config.consumer_budget = budget;
        }
        if let Some(interval) = self.persist_interval_ms {
            config.persist_interval_ms = interval;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = args.apply(BrokerConfig::from_env()?);
    config.validate().map_err(warren::WarrenError::Config)?;

    info!("Starting Warren broker on {}", config.bind_address());
    match &config.data_dir {
        Some(dir) => info!("Data directory: {}", dir),
        None => info!("Data directory: none (in-memory store)"),
    }
    info!(
        "Consumer budget: {} bytes, persist interval: {}ms",
        config.consumer_budget, config.persist_interval_ms
    );

    let server = Arc::new(BrokerServer::bind(config).await?);

    // Spawn the server task
    let runner = Arc::clone(&server);
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown();
            if let Err(e) = (&mut server_handle).await {
                error!("Server task failed: {}", e);
            }
        }
        _ = &mut server_handle => {
            info!("Server task completed");
        }
    }

    info!("Warren shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
