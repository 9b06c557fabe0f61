//! Provider trait and factory for answer providers

use async_trait::async_trait;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::provider::{
    echo::EchoProvider,
    errors::{ProviderError, ProviderResult},
    knowledge_base::KnowledgeBaseProvider,
    types::{AnswerRequest, AnswerStream},
};

/// An external retrieve-and-generate service.
///
/// Implementations return a stream of text fragments terminated by exactly one
/// [`AnswerEvent::Done`](crate::provider::AnswerEvent::Done) or an error. They
/// never retry internally.
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    /// Start a retrieve-and-generate call and get a stream of events
    async fn retrieve_and_generate(&self, request: AnswerRequest) -> ProviderResult<AnswerStream>;

    /// Get the provider name
    fn name(&self) -> &str;

    /// Validate the configuration
    fn validate_config(&self) -> ProviderResult<()>;
}

/// Factory for creating answer providers
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create a new provider from configuration
    pub fn create_provider(config: &ProviderConfig) -> ProviderResult<Box<dyn AnswerProvider>> {
        let provider: Box<dyn AnswerProvider> = match config.kind.as_str() {
            "knowledge_base" => Box::new(KnowledgeBaseProvider::new(config)?),
            "echo" => Box::new(EchoProvider::new()),
            other => {
                return Err(ProviderError::Config(format!(
                    "Unsupported provider kind: {}",
                    other
                )))
            }
        };
        provider.validate_config()?;
        Ok(provider)
    }

    /// Get available provider kinds
    pub fn available_providers() -> Vec<&'static str> {
        vec!["knowledge_base", "echo"]
    }
}

/// HTTP client options for network-backed providers
#[derive(Debug, Clone)]
pub struct ProviderClientOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for ProviderClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: format!("ragchat/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProviderClientOptions {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            ..Default::default()
        }
    }

    pub fn build_client(&self) -> ProviderResult<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to build HTTP client: {}", e)))
    }
}
