//! Scripted in-memory provider for tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::{
    errors::{ProviderError, ProviderResult},
    provider::AnswerProvider,
    types::{AnswerCompletion, AnswerEvent, AnswerRequest, AnswerStream},
};
use crate::session::Source;

#[derive(Debug, Clone)]
pub enum Step {
    Delta(String),
    Done(AnswerCompletion),
    Fail(ProviderError),
    /// Wait until the notify is triggered
    Pause(Arc<Notify>),
    /// Never produce another event
    Hang,
}

/// Replays the same script for every call and records the requests it saw
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Vec<Step>,
    invoke_error: Option<ProviderError>,
    requests: Mutex<Vec<AnswerRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Deltas followed by a completion carrying the given sources
    pub fn answering(chunks: &[&str], sources: Vec<Source>) -> Self {
        let mut steps: Vec<Step> = chunks.iter().map(|c| Step::Delta(c.to_string())).collect();
        steps.push(Step::Done(AnswerCompletion {
            final_text: chunks.concat(),
            sources,
            usage: None,
        }));
        Self::new(steps)
    }

    /// Fails before producing a stream
    pub fn failing(error: ProviderError) -> Self {
        Self {
            invoke_error: Some(error),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<AnswerRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AnswerProvider for ScriptedProvider {
    async fn retrieve_and_generate(&self, request: AnswerRequest) -> ProviderResult<AnswerStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(error) = &self.invoke_error {
            return Err(error.clone());
        }

        let steps = self.steps.clone();
        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    Step::Delta(text) => yield Ok(AnswerEvent::Delta { text }),
                    Step::Done(completion) => yield Ok(AnswerEvent::Done(completion)),
                    Step::Fail(error) => yield Err(error),
                    Step::Pause(notify) => notify.notified().await,
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn validate_config(&self) -> ProviderResult<()> {
        Ok(())
    }
}
