use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use streamgate_api::{AppState, WsTransport};
use streamgate_engine::{EngineConfig, StreamEngine};
use streamgate_exchanges::{SimulatedExchangeConfig, SimulatedExchangeFactory};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(about = "Market-data streaming gateway: multiplexed exchange subscriptions over WebSocket")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway against the simulated exchange feed
    Serve {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:3000", env = "STREAMGATE_BIND")]
        bind: String,

        /// Sliding TTL for cached exchange connections, in seconds
        /// (0 disables expiry)
        #[arg(long, default_value = "300")]
        session_ttl: u64,

        /// Simulated feed update interval, in milliseconds
        #[arg(long, default_value = "250")]
        tick_ms: u64,

        /// Exchange ids the simulated factory accepts (any id when empty)
        #[arg(long, value_delimiter = ',')]
        exchanges: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            session_ttl,
            tick_ms,
            exchanges,
        } => {
            serve(bind, session_ttl, tick_ms, exchanges).await?;
        }
    }

    Ok(())
}

async fn serve(bind: String, session_ttl: u64, tick_ms: u64, exchanges: Vec<String>) -> Result<()> {
    let feed_config = SimulatedExchangeConfig {
        tick_interval: Duration::from_millis(tick_ms),
        ..Default::default()
    };
    let mut factory = SimulatedExchangeFactory::new(feed_config);
    if !exchanges.is_empty() {
        tracing::info!(exchanges = ?exchanges, "restricting simulated feed");
        factory = factory.with_exchanges(exchanges);
    }

    let session_ttl = (session_ttl > 0).then(|| Duration::from_secs(session_ttl));
    let engine_config = EngineConfig {
        public_session_ttl: session_ttl,
        private_session_ttl: session_ttl,
    };

    let transport = Arc::new(WsTransport::new());
    let engine = Arc::new(StreamEngine::new(
        Arc::new(factory),
        transport.clone(),
        engine_config,
    ));
    let state = Arc::new(AppState::new(
        engine,
        transport,
        Arc::new(streamgate_api::auth::TrustedTokenVerifier),
    ));

    streamgate_api::start_server(state, &bind).await
}
