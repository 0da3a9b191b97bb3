//! Position Change Feed Simulator
//!
//! Streams position snapshots and increments over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use playground_simulator::config::{build_config, CliArgs as ConfigCliArgs, SimulatorConfig};
use playground_simulator::producer::StreamProducer;
use playground_simulator::server::Server;
use playground_simulator::source::{ChangeSource, MemoryChangeSource, PgChangeSource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Position change feed simulator
#[derive(Parser, Debug)]
#[command(name = "playground-simulator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long, env = "SIMULATOR_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SIMULATOR_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SIMULATOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Postgres connection string for the change table
    #[arg(long, env = "SIMULATOR_DATABASE_URL")]
    database_url: Option<String>,

    /// JSON seed file for the in-memory change table
    #[arg(long, env = "SIMULATOR_SEED_FILE", value_name = "FILE")]
    seed_file: Option<PathBuf>,
}

impl From<Args> for ConfigCliArgs {
    fn from(args: Args) -> Self {
        ConfigCliArgs {
            config_file: args.config,
            host: args.host,
            port: args.port,
            log_level: args.log_level,
            database_url: args.database_url,
            seed_file: args.seed_file,
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

async fn open_source(config: &SimulatorConfig) -> anyhow::Result<Arc<dyn ChangeSource>> {
    if let Some(url) = &config.database_url {
        tracing::info!("Reading change table from Postgres");
        let source = PgChangeSource::connect_lazy(url).context("invalid database url")?;
        return Ok(Arc::new(source));
    }

    if let Some(path) = &config.seed_file {
        let source = MemoryChangeSource::from_seed_file(path).await?;
        tracing::info!(path = %path.display(), rows = source.len().await, "Loaded seed file");
        return Ok(Arc::new(source));
    }

    tracing::warn!("No database or seed file configured; every stream will be heartbeat-only");
    Ok(Arc::new(MemoryChangeSource::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli_args: ConfigCliArgs = args.into();
    let config = build_config(&cli_args)?;

    init_tracing(config.log_level.as_filter_str(), config.log_json);

    tracing::info!("Position Stream Simulator v{}", playground_simulator::VERSION);
    tracing::info!(
        host = %config.host,
        port = %config.port,
        log_level = %config.log_level,
        database = config.database_url.is_some(),
        seed_file = ?config.seed_file,
        snapshot_end_heartbeats = config.stream.snapshot_end_heartbeats,
        fragment_probability = config.stream.fragment_probability,
        "Simulator configuration loaded"
    );

    let source = open_source(&config).await?;
    let producer = StreamProducer::new(source, config.stream.clone());

    let server = Server::new(config, producer);
    server.run().await?;

    Ok(())
}
