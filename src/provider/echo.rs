use async_trait::async_trait;
use futures::stream;

use super::{
    errors::ProviderResult,
    provider::AnswerProvider,
    types::{AnswerCompletion, AnswerEvent, AnswerRequest, AnswerStream},
};

/// Local development provider that streams the question back word by word.
/// Only used when configured explicitly with `kind = "echo"`.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

impl EchoProvider {
    pub fn new() -> Self {
        Self
    }

    fn fragments(text: &str) -> Vec<String> {
        let mut fragments = Vec::new();
        for (i, word) in text.split_whitespace().enumerate() {
            if i == 0 {
                fragments.push(word.to_string());
            } else {
                fragments.push(format!(" {}", word));
            }
        }
        fragments
    }
}

#[async_trait]
impl AnswerProvider for EchoProvider {
    async fn retrieve_and_generate(&self, request: AnswerRequest) -> ProviderResult<AnswerStream> {
        let answer = format!("You said: {}", request.query.trim());
        let mut events: Vec<ProviderResult<AnswerEvent>> = Self::fragments(&answer)
            .into_iter()
            .map(|text| Ok(AnswerEvent::Delta { text }))
            .collect();
        events.push(Ok(AnswerEvent::Done(AnswerCompletion {
            final_text: answer,
            sources: Vec::new(),
            usage: None,
        })));

        Ok(Box::pin(stream::iter(events)))
    }

    fn name(&self) -> &str {
        "echo"
    }

    fn validate_config(&self) -> ProviderResult<()> {
        Ok(())
    }
}
