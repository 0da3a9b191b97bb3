//! Position Stream Subscriptions Service
//!
//! Subscribes to the position stream and loads it into Postgres.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use playground_subscriptions::config::{build_config, CliArgs as ConfigCliArgs, ClientConfig};
use playground_subscriptions::consumer::StreamConsumer;
use playground_subscriptions::loader::InboundLoader;
use playground_subscriptions::registry::SubscriptionRegistry;
use playground_subscriptions::server::Server;
use playground_subscriptions::store::{InboundStore, MemoryInboundStore, PgInboundStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Position stream subscriptions service
#[derive(Parser, Debug)]
#[command(name = "playground-subscriptions")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long, env = "PLAYGROUND_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PLAYGROUND_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PLAYGROUND_LOG_LEVEL")]
    log_level: Option<String>,

    /// Base URL of the stream producer
    #[arg(long, env = "PLAYGROUND_SERVER_BASE_URL")]
    server_base_url: Option<String>,

    /// As-of date for new subscriptions (YYYY-MM-DD)
    #[arg(long, env = "PLAYGROUND_AS_OF_DATE")]
    as_of_date: Option<NaiveDate>,

    /// Postgres connection string for the staging tables
    #[arg(long, env = "PLAYGROUND_DATABASE_URL")]
    database_url: Option<String>,

    /// Start every configured target at startup
    #[arg(long)]
    start_all: bool,
}

impl From<&Args> for ConfigCliArgs {
    fn from(args: &Args) -> Self {
        ConfigCliArgs {
            config_file: args.config.clone(),
            host: args.host.clone(),
            port: args.port,
            log_level: args.log_level.clone(),
            server_base_url: args.server_base_url.clone(),
            as_of_date: args.as_of_date,
            database_url: args.database_url.clone(),
        }
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_store(config: &ClientConfig) -> anyhow::Result<Arc<dyn InboundStore>> {
    if let Some(url) = &config.database_url {
        tracing::info!("Staging into Postgres");
        let store = PgInboundStore::connect_lazy(url).context("invalid database url")?;
        return Ok(Arc::new(store));
    }

    tracing::warn!("No database configured; records are staged in memory and discarded on exit");
    Ok(Arc::new(MemoryInboundStore::with_columns(
        MemoryInboundStore::playground_columns(),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli_args = ConfigCliArgs::from(&args);
    let config = build_config(&cli_args)?;

    init_tracing(config.log_level.as_filter_str(), config.log_json);

    tracing::info!("Position Stream Subscriptions v{}", playground_subscriptions::VERSION);
    tracing::info!(
        host = %config.host,
        port = %config.port,
        log_level = %config.log_level,
        server_base_url = %config.server_base_url,
        as_of_date = ?config.as_of_date,
        chunk = config.chunk,
        database = config.database_url.is_some(),
        targets = config.targets.len(),
        "Subscriptions configuration loaded"
    );

    let loader = Arc::new(InboundLoader::new(open_store(&config)?));
    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let consumer = StreamConsumer::new(http, &config.server_base_url, config.chunk, loader)?;
    let registry = SubscriptionRegistry::new(consumer, config.targets.clone(), config.as_of_date);

    if args.start_all {
        registry.start_all_configured().await;
    }

    let server = Server::new(config, registry);
    server.run().await?;

    Ok(())
}
