use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use super::{ask::AskCommand, schema::SchemaCommand, serve::ServeCommand};
use crate::config::Config;

/// ragchat - streaming chat over a managed knowledge base
#[derive(Parser)]
#[command(
    name = "ragchat",
    version,
    about = "Streaming chat server over a managed knowledge-base answer service",
    long_about = r#"ragchat keeps bounded in-memory chat sessions and streams answers from a
retrieve-and-generate service to WebSocket and HTTP clients.

Examples:
  ragchat                               # Start the server with default settings
  ragchat serve --port 9000             # Start the server on another port
  ragchat ask "what is our leave policy"  # Ask a single question
  ragchat schema docs                   # Show configuration documentation"#
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Configuration file (defaults to ./ragchat.json, ./.ragchat.json, then the user config dir)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve(ServeCommand),
    /// Ask a single question and stream the answer
    Ask(AskCommand),
    /// Generate and validate configuration schemas
    Schema(SchemaCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        if self.debug {
            debug!("Debug logging enabled");
        }

        let config = Config::init(self.config.as_deref()).await?;
        debug!("Configuration initialized");

        match self.command {
            Some(Commands::Serve(serve)) => serve.execute(config).await,
            Some(Commands::Ask(ask)) => ask.execute(config).await,
            Some(Commands::Schema(schema)) => schema.execute(&config).await,
            None => ServeCommand::default().execute(config).await,
        }
    }
}
