use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod chat;
mod cli;
mod config;
mod provider;
mod server;
mod session;

use cli::Cli;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.debug) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = dotenv {
        // Don't error if .env file doesn't exist, just log it
        tracing::debug!("No .env file found or error loading it: {}", e);
    }

    if let Err(e) = cli.execute().await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) -> Result<()> {
    let default_filter = if debug {
        "ragchat=debug,tower_http=debug"
    } else {
        "ragchat=info,tower_http=info"
    };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    Ok(())
}
