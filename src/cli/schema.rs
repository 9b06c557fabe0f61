//! Schema command implementation for configuration validation and JSON schema generation

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use schemars::schema_for;
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::Config;

const DEFAULT_TITLE: &str = "ragchat Configuration";
const DEFAULT_DESCRIPTION: &str = "Configuration schema for the ragchat server";

/// Generate and validate configuration schemas
#[derive(Debug, Args)]
pub struct SchemaCommand {
    /// Output format for schema generation
    #[arg(short, long, default_value = "json")]
    pub format: SchemaFormat,

    /// Output file path (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Pretty print the output
    #[arg(short, long)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Option<SchemaSubcommand>,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum SchemaFormat {
    Json,
    Yaml,
}

#[derive(Debug, Subcommand)]
pub enum SchemaSubcommand {
    /// Generate JSON schema for configuration
    Generate {
        /// Schema title
        #[arg(long, default_value = DEFAULT_TITLE)]
        title: String,

        /// Schema description
        #[arg(long, default_value = DEFAULT_DESCRIPTION)]
        description: String,
    },
    /// Validate a configuration file against the schema
    Validate {
        /// Configuration file to validate
        config_file: PathBuf,

        /// Schema file to validate against (optional)
        #[arg(long)]
        schema_file: Option<PathBuf>,
    },
    /// Show configuration documentation
    Docs,
}

impl SchemaCommand {
    /// Execute the schema command
    pub async fn execute(&self, _config: &Config) -> Result<()> {
        match &self.command {
            Some(SchemaSubcommand::Generate { title, description }) => self.generate_schema(title, description),
            Some(SchemaSubcommand::Validate {
                config_file,
                schema_file,
            }) => self.validate_config(config_file, schema_file.as_deref()),
            Some(SchemaSubcommand::Docs) => {
                self.show_docs();
                Ok(())
            }
            None => self.generate_schema(DEFAULT_TITLE, DEFAULT_DESCRIPTION),
        }
    }

    fn render_schema(&self, title: &str, description: &str) -> Result<String> {
        let schema = schema_for!(Config);
        let mut schema_value = serde_json::to_value(schema).context("Failed to convert schema to JSON value")?;

        if let Some(obj) = schema_value.as_object_mut() {
            obj.insert("title".to_string(), Value::String(title.to_string()));
            obj.insert("description".to_string(), Value::String(description.to_string()));
        }

        let output = match self.format {
            SchemaFormat::Json => {
                if self.pretty {
                    serde_json::to_string_pretty(&schema_value)?
                } else {
                    serde_json::to_string(&schema_value)?
                }
            }
            SchemaFormat::Yaml => serde_yaml::to_string(&schema_value).context("Failed to convert schema to YAML")?,
        };
        Ok(output)
    }

    fn generate_schema(&self, title: &str, description: &str) -> Result<()> {
        let output = self.render_schema(title, description)?;

        if let Some(ref output_path) = self.output {
            fs::write(output_path, output)
                .with_context(|| format!("Failed to write schema to: {}", output_path.display()))?;
            println!("Schema written to: {}", output_path.display());
        } else {
            println!("{}", output);
        }

        Ok(())
    }

    /// Schema validation errors for a configuration file, empty when valid
    fn schema_errors(config_file: &Path, schema_file: Option<&Path>) -> Result<(Value, Vec<String>)> {
        let config_content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {}", config_file.display()))?;

        let is_yaml = matches!(
            config_file.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let config_value: Value = if is_yaml {
            serde_yaml::from_str(&config_content)
                .with_context(|| format!("Failed to parse YAML config: {}", config_file.display()))?
        } else {
            serde_json::from_str(&config_content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_file.display()))?
        };

        let schema_value: Value = match schema_file {
            Some(schema_path) => {
                let schema_content = fs::read_to_string(schema_path)
                    .with_context(|| format!("Failed to read schema file: {}", schema_path.display()))?;
                serde_json::from_str(&schema_content)
                    .with_context(|| format!("Failed to parse schema file: {}", schema_path.display()))?
            }
            None => serde_json::to_value(schema_for!(Config))?,
        };

        let compiled_schema = jsonschema::JSONSchema::compile(&schema_value)
            .map_err(|e| anyhow!("Failed to compile JSON schema: {}", e))?;

        let errors = match compiled_schema.validate(&config_value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| format!("{}: {}", error.instance_path, error))
                .collect(),
        };

        Ok((config_value, errors))
    }

    fn validate_config(&self, config_file: &Path, schema_file: Option<&Path>) -> Result<()> {
        let (config_value, errors) = Self::schema_errors(config_file, schema_file)?;

        if !errors.is_empty() {
            println!("Configuration validation failed:");
            for error in &errors {
                println!("  - {}", error);
            }
            return Err(anyhow!("Configuration validation failed"));
        }
        println!("Configuration matches the schema");

        let config: Config =
            serde_json::from_value(config_value).context("Configuration is schema-valid but cannot be loaded")?;
        config
            .validate()
            .map_err(|e| anyhow!("Configuration is schema-valid but not usable: {}", e))?;
        println!("Configuration can be loaded successfully");

        Ok(())
    }

    fn show_docs(&self) {
        println!("ragchat Configuration Documentation");
        println!("===================================\n");

        println!("Configuration File Locations:");
        println!("  1. --config <path> (explicit)");
        println!("  2. ./ragchat.json (project-specific)");
        println!("  3. ./.ragchat.json (project-specific, hidden)");
        println!("  4. ~/.config/ragchat/ragchat.json (user-specific)");
        println!("  Environment variables override file values; .env is loaded first.\n");

        println!("Environment Variables:");
        println!("  RAGCHAT_HOST, RAGCHAT_PORT                 - Listen address");
        println!("  RAGCHAT_MAX_SESSIONS                       - Resident sessions before LRU eviction");
        println!("  RAGCHAT_MAX_MESSAGES_PER_SESSION           - Messages kept per session");
        println!("  RAGCHAT_HISTORY_MAX_TURNS                  - Prior turns sent as context");
        println!("  RAGCHAT_HISTORY_MAX_CHARS                  - Size cap of the context");
        println!("  RAGCHAT_MAX_MESSAGE_CHARS                  - Longest accepted user message");
        println!("  RAGCHAT_IDLE_TIMEOUT_SECS                  - Wait limit for the next provider event");
        println!("  RAGCHAT_PROVIDER                           - knowledge_base or echo");
        println!("  RAGCHAT_BASE_URL, RAGCHAT_API_KEY          - Knowledge base endpoint and key");
        println!("  RAGCHAT_KNOWLEDGE_BASE_ID, RAGCHAT_MODEL_ID");
        println!("  RAGCHAT_NUMBER_OF_RESULTS                  - Retrieved passages per query");
        println!("  RAGCHAT_CONNECT_TIMEOUT_SECS, RAGCHAT_READ_TIMEOUT_SECS");
        println!("  RUST_LOG                                   - Log filter (default ragchat=info)\n");

        println!("Configuration Sections:");
        println!("  server    - Listen address");
        println!("  store     - Session and message bounds");
        println!("  history   - Context window sent to the provider");
        println!("  chat      - Message limits and provider idle timeout");
        println!("  provider  - Answer provider selection and connection settings\n");

        println!("Example Configuration:");
        println!("{}", Self::example_config());
    }

    fn example_config() -> &'static str {
        r#"{
  "server": { "host": "0.0.0.0", "port": 8000 },
  "store": { "max_sessions": 1000, "max_messages_per_session": 100 },
  "history": { "max_turns": 3, "max_chars": 8000 },
  "chat": { "max_message_chars": 10000, "idle_timeout_secs": 120 },
  "provider": {
    "kind": "knowledge_base",
    "base_url": "https://kb.example.com",
    "api_key": "change-me",
    "knowledge_base_id": "KB12345",
    "model_id": "anthropic.claude-3-sonnet",
    "number_of_results": 5,
    "connect_timeout_secs": 30,
    "read_timeout_secs": 60
  }
}"#
    }
}
