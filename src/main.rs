use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use progressive_reasoning::{
    config::{Config, LogFormat},
    engine::AdapterRegistry,
    server::{AppState, McpServer},
    storage::open_storage,
    SessionOrchestrator,
};

/// MCP server for persisted, branchable, revisable reasoning sessions
#[derive(Debug, Parser)]
#[command(name = "progressive-reasoning", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the MCP server over stdio (default)
    Serve,
    /// Delete sessions that have not been updated recently
    Cleanup {
        /// Age threshold in hours (defaults to SESSION_MAX_AGE_HOURS)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.database.backend,
        "Progressive reasoning starting"
    );

    let storage = match open_storage(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Storage initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize storage");
            return Err(e.into());
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let state = Arc::new(AppState::new(config, storage));
            let server = McpServer::new(state);

            info!("Server ready, waiting for requests on stdin");

            if let Err(e) = server.run().await {
                error!(error = %e, "Server error");
                return Err(e.into());
            }

            info!("Server shutdown complete");
        }
        Command::Cleanup { older_than_hours } => {
            let orchestrator = SessionOrchestrator::new(
                storage,
                AdapterRegistry::new(),
                config.engine.clone(),
            );
            let removed = orchestrator.cleanup(older_than_hours).await?;
            println!("{}", removed);
        }
    }

    Ok(())
}

/// Initialize tracing/logging. Output always goes to stderr.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
