//! Sentinel Orchestrator daemon.
//!
//! Behavioral risk scoring server for authenticated web sessions.

use clap::{Parser, Subcommand};
use sentinel_orchestrator::config::Config;
use sentinel_orchestrator::orchestrator::Orchestrator;
use sentinel_orchestrator::server::{self, ServerConfig};
use sentinel_orchestrator::store::{PostgresModelStore, PostgresTrustedContextStore, RedisSessionStore};
use sentinel_orchestrator::VERSION;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sentinel-orchestrd")]
#[command(author = "Sentinel")]
#[command(version = VERSION)]
#[command(about = "Behavioral risk orchestrator for authenticated web sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and block until it is shut down.
    Serve {
        /// Address to bind to, overriding the config file / env.
        #[arg(long)]
        bind: Option<String>,

        /// Port to bind to, overriding the config file / env.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the resolved configuration and exit.
    Config,

    /// Print health-check style version info and exit.
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_serve(bind, port))
        }
        Commands::Config => {
            cmd_config();
            Ok(())
        }
        Commands::Version => {
            println!("sentinel-orchestrd {VERSION}");
            Ok(())
        }
    }
}

async fn run_serve(bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("failed to load config, using defaults: {e}");
        Config::default()
    });
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }

    tracing::info!("connecting to session store at {}", config.redis_url);
    let sessions = Arc::new(RedisSessionStore::connect(&config.redis_url).await?);

    tracing::info!("connecting to model/context store at {}", config.database_url);
    let models = Arc::new(PostgresModelStore::connect(&config.database_url).await?);
    let context_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let trusted = Arc::new(PostgresTrustedContextStore::new(context_pool));

    let orchestrator = Arc::new(Orchestrator::new(sessions, models, trusted));

    let server_config = ServerConfig::new(config.bind_addr.clone(), config.port);
    let (addr, shutdown_tx) = server::run(server_config, orchestrator).await?;
    tracing::info!("sentinel-orchestrd {VERSION} listening on {addr}");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    Ok(())
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "error".to_string())
    );
}
