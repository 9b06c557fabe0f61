use anyhow::{anyhow, Result};
use clap::Args;
use std::io::{self, Read};
use tracing::{debug, info};

use crate::app::App;
use crate::config::Config;

/// Ask a single question non-interactively
#[derive(Debug, Args)]
pub struct AskCommand {
    /// The question. If not provided, it is read from stdin
    pub prompt: Vec<String>,

    /// Session to continue (created if absent)
    #[arg(short = 's', long = "session")]
    pub session: Option<String>,

    /// Print only the final answer instead of streaming chunks
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl AskCommand {
    pub async fn execute(&self, config: Config) -> Result<()> {
        debug!("Executing ask command");

        let prompt = self.get_prompt()?;
        if prompt.trim().is_empty() {
            return Err(anyhow!("No prompt provided. Use arguments or pipe input via stdin."));
        }

        info!("Asking: {}", prompt.chars().take(50).collect::<String>());

        config.validate()?;
        let app = App::new(config)?;

        let mut stdout = io::stdout();
        app.run_non_interactive(self.session.as_deref(), &prompt, self.quiet, &mut stdout)
            .await?;
        Ok(())
    }

    fn get_prompt(&self) -> Result<String> {
        if !self.prompt.is_empty() {
            Ok(self.prompt.join(" "))
        } else {
            debug!("Reading prompt from stdin");
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| anyhow!("Failed to read from stdin: {}", e))?;
            Ok(buffer)
        }
    }
}
