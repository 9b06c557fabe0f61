//! Request and event types exchanged with answer providers

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use futures::Stream;

use crate::provider::errors::ProviderResult;
use crate::session::{Role, Source};

/// One prior conversational turn passed to the provider as context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorTurn {
    pub role: Role,
    pub content: String,
}

/// A single retrieve-and-generate call
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRequest {
    /// The current user turn
    pub query: String,
    /// Prior turns, oldest first
    pub history: Vec<PriorTurn>,
    pub session_id: String,
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// A citation as reported by the provider, before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSource {
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl RetrievedSource {
    /// Normalize into a stored [`Source`]. The document name falls back to the
    /// last path segment of the URI; scores are clamped and rounded to 3 decimals.
    pub fn into_source(self) -> Source {
        let document = self
            .document
            .filter(|d| !d.trim().is_empty())
            .or_else(|| {
                self.uri.as_deref().and_then(|uri| {
                    uri.trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .filter(|segment| !segment.is_empty())
                        .map(str::to_string)
                })
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let score = (self.score.unwrap_or(0.0).clamp(0.0, 1.0) * 1000.0).round() / 1000.0;

        let mut source = Source::new(document, score);
        if let Some(uri) = self.uri {
            source = source.with_uri(uri);
        }
        if let Some(page) = self.page {
            source = source.with_page(page);
        }
        source
    }
}

/// Final provider payload terminating a successful stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerCompletion {
    pub final_text: String,
    pub sources: Vec<Source>,
    pub usage: Option<UsageMetadata>,
}

/// Events produced by an answer provider stream
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    /// An incremental text fragment
    Delta { text: String },
    /// Terminal success
    Done(AnswerCompletion),
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = ProviderResult<AnswerEvent>> + Send>>;
