use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::RETRY_AFTER, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use super::{
    errors::{ProviderError, ProviderResult},
    provider::{AnswerProvider, ProviderClientOptions},
    types::{AnswerCompletion, AnswerEvent, AnswerRequest, AnswerStream, PriorTurn, RetrievedSource, UsageMetadata},
};

/// Client for a managed knowledge-base retrieve-and-generate endpoint
#[derive(Debug, Clone)]
pub struct KnowledgeBaseProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    knowledge_base_id: String,
    model_id: Option<String>,
    number_of_results: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveAndGenerateRequest<'a> {
    knowledge_base_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_id: Option<&'a str>,
    input: RequestInput<'a>,
    history: &'a [PriorTurn],
    number_of_results: u32,
}

#[derive(Debug, Serialize)]
struct RequestInput<'a> {
    text: &'a str,
}

/// One line of the NDJSON response stream
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Delta {
        #[serde(default)]
        text: String,
    },
    Done {
        #[serde(rename = "finalText", default)]
        final_text: String,
        #[serde(default)]
        sources: Vec<RetrievedSource>,
        #[serde(default)]
        usage: Option<UsageMetadata>,
    },
    Error {
        #[serde(default)]
        kind: String,
        #[serde(default)]
        message: String,
    },
}

impl KnowledgeBaseProvider {
    pub fn new(config: &ProviderConfig) -> ProviderResult<Self> {
        Self::with_options(config, ProviderClientOptions::from_config(config))
    }

    pub fn with_options(config: &ProviderConfig, options: ProviderClientOptions) -> ProviderResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ProviderError::Config("base_url is required for the knowledge_base provider".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let knowledge_base_id = config
            .knowledge_base_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::Config("knowledge_base_id is required for the knowledge_base provider".to_string())
            })?;

        Ok(Self {
            client: options.build_client()?,
            base_url,
            api_key: config.api_key.clone(),
            knowledge_base_id,
            model_id: config.model_id.clone(),
            number_of_results: config.number_of_results,
        })
    }

    fn parse_line(line: &[u8]) -> ProviderResult<Option<AnswerEvent>> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let parsed: StreamLine = serde_json::from_str(line)
            .map_err(|e| ProviderError::Invocation(format!("Malformed provider event: {}", e)))?;

        match parsed {
            StreamLine::Delta { text } => Ok(Some(AnswerEvent::Delta { text })),
            StreamLine::Done {
                final_text,
                sources,
                usage,
            } => Ok(Some(AnswerEvent::Done(AnswerCompletion {
                final_text,
                sources: sources.into_iter().map(RetrievedSource::into_source).collect(),
                usage,
            }))),
            StreamLine::Error { kind, message } => Err(ProviderError::from_kind(&kind, message)),
        }
    }
}

/// Splits a byte stream into newline-terminated lines across chunk boundaries
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[async_trait]
impl AnswerProvider for KnowledgeBaseProvider {
    async fn retrieve_and_generate(&self, request: AnswerRequest) -> ProviderResult<AnswerStream> {
        let url = format!("{}/retrieve-and-generate", self.base_url);

        debug!(
            "Starting retrieve-and-generate for session {} ({} prior turns)",
            request.session_id,
            request.history.len()
        );

        let body = RetrieveAndGenerateRequest {
            knowledge_base_id: &self.knowledge_base_id,
            model_id: self.model_id.as_deref(),
            input: RequestInput { text: &request.query },
            history: &request.history,
            number_of_results: self.number_of_results,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let error_text = response.text().await.unwrap_or_default();

            let error = ProviderError::from_status(status, &error_text, retry_after);
            if matches!(error, ProviderError::RateLimited { .. }) {
                warn!("Knowledge base throttled the request: {}", error);
            }
            return Err(error);
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = LineDecoder::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                };
                for line in decoder.push(&chunk) {
                    match Self::parse_line(&line) {
                        Ok(Some(event)) => {
                            let done = matches!(event, AnswerEvent::Done(_));
                            yield Ok(event);
                            if done {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(line) = decoder.finish() {
                match Self::parse_line(&line) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "knowledge_base"
    }

    fn validate_config(&self) -> ProviderResult<()> {
        if self.number_of_results == 0 {
            return Err(ProviderError::Config("number_of_results must be positive".to_string()));
        }
        Ok(())
    }
}
