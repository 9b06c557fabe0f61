use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::app::App;
use crate::config::Config;
use crate::server::shutdown_signal;

/// Run the HTTP and WebSocket server
#[derive(Debug, Default, Args)]
pub struct ServeCommand {
    /// Interface to bind (overrides configuration)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides configuration)
    #[arg(short = 'p', long)]
    pub port: Option<u16>,
}

impl ServeCommand {
    pub async fn execute(self, mut config: Config) -> Result<()> {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config.validate()?;

        let addr = config.socket_addr()?;
        let app = App::new(config)?;

        info!("Starting server on {}", addr);
        app.run_server(addr, shutdown_signal()).await
    }
}
