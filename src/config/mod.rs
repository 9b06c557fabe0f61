use anyhow::{anyhow, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::chat::ChatSettings;
use crate::provider::ProviderFactory;
use crate::session::{HistoryFormatter, StoreLimits};

/// Application configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub history: HistoryConfig,
    pub chat: ChatConfig,
    pub provider: ProviderConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Session store bounds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    /// Resident sessions before least-recently-used eviction
    pub max_sessions: usize,
    /// Messages kept per session; older ones are dropped first
    pub max_messages_per_session: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self {
            max_sessions: limits.max_sessions,
            max_messages_per_session: limits.max_messages_per_session,
        }
    }
}

/// Prior-turn context sent to the provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HistoryConfig {
    /// User/assistant turns included as context
    pub max_turns: usize,
    /// Maximum serialized size of the context
    pub max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let formatter = HistoryFormatter::default();
        Self {
            max_turns: formatter.max_turns,
            max_chars: formatter.max_chars,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ChatConfig {
    /// Longest accepted user message, in characters
    pub max_message_chars: usize,
    /// Longest wait for the provider's next event
    pub idle_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 10_000,
            idle_timeout_secs: 120,
        }
    }
}

/// Answer provider selection and connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProviderConfig {
    /// `knowledge_base` or `echo`
    pub kind: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub knowledge_base_id: Option<String>,
    pub model_id: Option<String>,
    /// Retrieved passages per query
    pub number_of_results: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "knowledge_base".to_string(),
            base_url: None,
            api_key: None,
            knowledge_base_id: None,
            model_id: None,
            number_of_results: 5,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Initialize configuration: defaults, then the config file, then environment
    pub async fn init(explicit_path: Option<&Path>) -> Result<Self> {
        debug!("Initializing configuration");

        let mut config = match Self::load_from_file(explicit_path).await? {
            Some(config) => config,
            None => Self::default(),
        };
        config.load_from_env();

        Ok(config)
    }

    /// Candidate configuration files, highest priority first
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./ragchat.json"), PathBuf::from("./.ragchat.json")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("ragchat").join("ragchat.json"));
        }
        paths
    }

    /// Load the explicit file, or the first existing default file
    pub async fn load_from_file(explicit_path: Option<&Path>) -> Result<Option<Self>> {
        if let Some(path) = explicit_path {
            return Self::read_file(path).await.map(Some);
        }

        for path in Self::config_paths() {
            if path.exists() {
                return Self::read_file(&path).await.map(Some);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    async fn read_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from `RAGCHAT_*` environment variables
    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!("Ignoring invalid value for {}: {}", key, value);
                    None
                }
            }
        }

        macro_rules! set_parsed {
            ($key:literal, $field:expr) => {
                if let Some(value) = parsed($key, lookup($key)) {
                    $field = value;
                }
            };
        }

        if let Some(host) = lookup("RAGCHAT_HOST") {
            self.server.host = host;
        }
        set_parsed!("RAGCHAT_PORT", self.server.port);
        set_parsed!("RAGCHAT_MAX_SESSIONS", self.store.max_sessions);
        set_parsed!("RAGCHAT_MAX_MESSAGES_PER_SESSION", self.store.max_messages_per_session);
        set_parsed!("RAGCHAT_HISTORY_MAX_TURNS", self.history.max_turns);
        set_parsed!("RAGCHAT_HISTORY_MAX_CHARS", self.history.max_chars);
        set_parsed!("RAGCHAT_MAX_MESSAGE_CHARS", self.chat.max_message_chars);
        set_parsed!("RAGCHAT_IDLE_TIMEOUT_SECS", self.chat.idle_timeout_secs);

        if let Some(kind) = lookup("RAGCHAT_PROVIDER") {
            self.provider.kind = kind;
        }
        if let Some(base_url) = lookup("RAGCHAT_BASE_URL") {
            self.provider.base_url = Some(base_url);
        }
        if let Some(api_key) = lookup("RAGCHAT_API_KEY") {
            self.provider.api_key = Some(api_key);
        }
        if let Some(id) = lookup("RAGCHAT_KNOWLEDGE_BASE_ID") {
            self.provider.knowledge_base_id = Some(id);
        }
        if let Some(model_id) = lookup("RAGCHAT_MODEL_ID") {
            self.provider.model_id = Some(model_id);
        }
        set_parsed!("RAGCHAT_NUMBER_OF_RESULTS", self.provider.number_of_results);
        set_parsed!("RAGCHAT_CONNECT_TIMEOUT_SECS", self.provider.connect_timeout_secs);
        set_parsed!("RAGCHAT_READ_TIMEOUT_SECS", self.provider.read_timeout_secs);
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("server.port must be greater than 0"));
        }
        if self.store.max_sessions == 0 {
            return Err(anyhow!("store.max_sessions must be greater than 0"));
        }
        if self.store.max_messages_per_session == 0 {
            return Err(anyhow!("store.max_messages_per_session must be greater than 0"));
        }
        if self.history.max_chars == 0 {
            return Err(anyhow!("history.max_chars must be greater than 0"));
        }
        if self.chat.max_message_chars == 0 {
            return Err(anyhow!("chat.max_message_chars must be greater than 0"));
        }
        if self.chat.idle_timeout_secs == 0 {
            return Err(anyhow!("chat.idle_timeout_secs must be greater than 0"));
        }

        let provider = &self.provider;
        if !ProviderFactory::available_providers().contains(&provider.kind.as_str()) {
            return Err(anyhow!(
                "Unsupported provider kind: {} (expected one of: {})",
                provider.kind,
                ProviderFactory::available_providers().join(", ")
            ));
        }
        if provider.kind == "knowledge_base" {
            if provider.base_url.as_deref().map_or(true, |url| url.trim().is_empty()) {
                return Err(anyhow!(
                    "provider.base_url is required for the knowledge_base provider (or set RAGCHAT_BASE_URL)"
                ));
            }
            if provider.knowledge_base_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
                return Err(anyhow!(
                    "provider.knowledge_base_id is required for the knowledge_base provider (or set RAGCHAT_KNOWLEDGE_BASE_ID)"
                ));
            }
            if provider.number_of_results == 0 {
                return Err(anyhow!("provider.number_of_results must be greater than 0"));
            }
        }
        if provider.connect_timeout_secs == 0 || provider.read_timeout_secs == 0 {
            return Err(anyhow!("provider timeouts must be greater than 0"));
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.server.host.as_str(), self.server.port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen address {}:{}", self.server.host, self.server.port))?
            .next()
            .ok_or_else(|| anyhow!("No address for {}:{}", self.server.host, self.server.port))
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_sessions: self.store.max_sessions,
            max_messages_per_session: self.store.max_messages_per_session,
        }
    }

    pub fn history_formatter(&self) -> HistoryFormatter {
        HistoryFormatter::new(self.history.max_turns, self.history.max_chars)
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            max_message_chars: self.chat.max_message_chars,
            idle_timeout: Duration::from_secs(self.chat.idle_timeout_secs),
        }
    }
}
