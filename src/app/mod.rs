//! Application composition
//!
//! Builds the session store, answer provider, chat service and server state
//! from a [`Config`], and runs either the server or a one-shot exchange.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    chat::{ChatEvent, ChatService},
    config::Config,
    provider::{AnswerProvider, ProviderFactory},
    server::{self, AppState},
    session::{Message, SessionStore},
};

/// Main application structure
pub struct App {
    state: AppState,
}

impl App {
    /// Create a new application instance
    pub fn new(config: Config) -> Result<Self> {
        debug!("Creating new App instance");
        let provider = ProviderFactory::create_provider(&config.provider)?;
        Ok(Self::with_provider(&config, Arc::from(provider)))
    }

    /// Create an application around an existing provider
    pub fn with_provider(config: &Config, provider: Arc<dyn AnswerProvider>) -> Self {
        let store = Arc::new(SessionStore::new(config.store_limits()));
        let chat = Arc::new(ChatService::new(
            store,
            provider,
            config.history_formatter(),
            config.chat_settings(),
        ));

        info!("Using answer provider: {}", chat.provider_name());
        Self {
            state: AppState::new(chat),
        }
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.state.chat
    }

    /// Run the HTTP/WebSocket server until `shutdown` resolves
    pub async fn run_server<F>(&self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        server::serve(self.state.clone(), addr, shutdown).await
    }

    /// Run a single exchange, writing chunks to `out` as they arrive unless
    /// `quiet`, in which case only the final answer is written
    pub async fn run_non_interactive<W: Write>(
        &self,
        session_id: Option<&str>,
        prompt: &str,
        quiet: bool,
        out: &mut W,
    ) -> Result<Message> {
        let store = self.chat().store();
        let session_id = match session_id {
            Some(id) => store.get_or_create(id).await.id,
            None => store.create_session().await.id,
        };
        debug!("Running one-shot exchange on session {}", session_id);

        let mut stream = self.chat().begin(session_id, prompt, CancellationToken::new());
        while let Some(event) = stream.next().await {
            match event {
                ChatEvent::Chunk { content, .. } => {
                    if !quiet {
                        write!(out, "{}", content)?;
                        out.flush()?;
                    }
                }
                ChatEvent::Complete { message, .. } => {
                    if quiet {
                        write!(out, "{}", message.content)?;
                    }
                    writeln!(out)?;
                    if let Some(sources) = &message.sources {
                        writeln!(out)?;
                        writeln!(out, "Sources:")?;
                        for source in sources {
                            writeln!(out, "  - {} ({:.3})", source.document, source.score)?;
                        }
                    }
                    return Ok(message);
                }
                ChatEvent::Failed { error, .. } => {
                    return Err(anyhow!("{} ({})", error, error.code()));
                }
            }
        }

        Err(anyhow!("exchange ended without a result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedProvider;
    use crate::provider::ProviderError;
    use crate::session::Source;

    fn echo_config() -> Config {
        let mut config = Config::default();
        config.provider.kind = "echo".to_string();
        config
    }

    #[tokio::test]
    async fn test_new_uses_configured_provider() {
        let app = App::new(echo_config()).unwrap();
        assert_eq!(app.chat().provider_name(), "echo");
        assert!(App::new(Config::default()).is_err());
    }

    #[tokio::test]
    async fn test_run_non_interactive_streams_output() {
        let provider = ScriptedProvider::answering(&["Hi", " there"], vec![Source::new("doc.pdf", 0.9)]);
        let app = App::with_provider(&echo_config(), Arc::new(provider));

        let mut out = Vec::new();
        let message = app
            .run_non_interactive(Some("s1"), "hello", false, &mut out)
            .await
            .unwrap();

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.starts_with("Hi there\n"));
        assert!(printed.contains("doc.pdf (0.900)"));
        assert_eq!(message.content, "Hi there");
        assert_eq!(app.chat().store().list_messages("s1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_non_interactive_quiet_and_failure() {
        let app = App::with_provider(&echo_config(), Arc::new(ScriptedProvider::answering(&["a", "b"], Vec::new())));
        let mut out = Vec::new();
        app.run_non_interactive(None, "q", true, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "ab\n");

        let failing = ScriptedProvider::failing(ProviderError::Invocation("denied".to_string()));
        let app = App::with_provider(&echo_config(), Arc::new(failing));
        let error = app
            .run_non_interactive(None, "q", false, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("PROVIDER_INVOCATION_ERROR"));
    }
}
