//! Streaming session controller
//!
//! A [`StreamingController`] owns exactly one question/answer exchange. It
//! appends the user message, builds provider context, drives the provider
//! stream and persists the assembled answer before reporting completion.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::{
    errors::{ChatError, ChatResult},
    events::ChatEvent,
    gate::{GateTicket, SessionGates},
};
use crate::provider::{AnswerEvent, AnswerProvider, AnswerRequest, AnswerStream};
use crate::session::{HistoryFormatter, Message, NewMessage, SessionStore};

pub type ChatStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Lifecycle of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    ProviderInvoked,
    Streaming,
    Completed,
    Failed,
}

impl ControllerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Completed | ControllerState::Failed)
    }

    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Idle, ProviderInvoked)
                | (Idle, Failed)
                | (ProviderInvoked, Streaming)
                | (ProviderInvoked, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }
}

/// Limits applied to every exchange
#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub max_message_chars: usize,
    /// Longest wait for the provider to open a stream or produce its next event
    pub idle_timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_message_chars: 10_000,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Shared dependencies for chat exchanges
pub struct ChatService {
    store: Arc<SessionStore>,
    provider: Arc<dyn AnswerProvider>,
    history: HistoryFormatter,
    gates: SessionGates,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn AnswerProvider>,
        history: HistoryFormatter,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            provider,
            history,
            gates: SessionGates::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Start an exchange on an existing session.
    ///
    /// The session's turn is reserved here, so exchanges on one session run in
    /// the order `begin` was called. The returned stream is otherwise lazy and
    /// single-use. Dropping it abandons the exchange and its turn; cancelling
    /// `cancel` ends it with [`ChatError::Cancelled`].
    pub fn begin(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        text: impl Into<String>,
        cancel: CancellationToken,
    ) -> ChatStream {
        let session_id = session_id.into();
        let ticket = self.gates.reserve(&session_id);
        StreamingController::new(self.clone(), session_id, cancel).run(text.into(), ticket)
    }

    /// Sessions with a generation running or queued
    pub fn active_generations(&self) -> usize {
        self.gates.active()
    }

    /// Run an exchange to completion and return the stored assistant message
    pub async fn ask(self: &Arc<Self>, session_id: &str, text: &str) -> ChatResult<Message> {
        let mut stream = self.begin(session_id, text, CancellationToken::new());
        while let Some(event) = stream.next().await {
            match event {
                ChatEvent::Chunk { .. } => {}
                ChatEvent::Complete { message, .. } => return Ok(message),
                ChatEvent::Failed { error, .. } => return Err(error),
            }
        }
        Err(ChatError::ProviderTransport(
            "exchange ended without a result".to_string(),
        ))
    }

    /// Reject blank or oversized messages before any session is touched
    pub(crate) fn validate(&self, text: &str) -> ChatResult<()> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("Message cannot be empty".to_string()));
        }
        if text.chars().count() > self.settings.max_message_chars {
            return Err(ChatError::Validation(format!(
                "Message exceeds {} characters",
                self.settings.max_message_chars
            )));
        }
        Ok(())
    }
}

/// Per-request state machine
pub struct StreamingController {
    service: Arc<ChatService>,
    session_id: String,
    cancel: CancellationToken,
    state: ControllerState,
}

impl StreamingController {
    fn new(service: Arc<ChatService>, session_id: String, cancel: CancellationToken) -> Self {
        Self {
            service,
            session_id,
            cancel,
            state: ControllerState::Idle,
        }
    }

    fn transition(&mut self, next: ControllerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Controller {}: {:?} -> {:?}", self.session_id, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: ChatError) -> ChatEvent {
        match &error {
            ChatError::Cancelled => info!("Chat cancelled: session={}", self.session_id),
            ChatError::Validation(_) | ChatError::SessionNotFound(_) | ChatError::RequestInProgress(_) => {
                debug!("Chat rejected: session={}, {}", self.session_id, error)
            }
            ChatError::ProviderRateLimited { .. } => {
                warn!("Chat throttled: session={}, {}", self.session_id, error)
            }
            ChatError::ProviderTransport(_) | ChatError::ProviderInvocation(_) => {
                error!("Chat failed: session={}, {}", self.session_id, error)
            }
        }
        self.transition(ControllerState::Failed);
        ChatEvent::Failed {
            session_id: self.session_id.clone(),
            error,
        }
    }

    async fn open(&self, request: AnswerRequest) -> ChatResult<AnswerStream> {
        let idle = self.service.settings.idle_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChatError::Cancelled),
            result = tokio::time::timeout(idle, self.service.provider.retrieve_and_generate(request)) => {
                match result {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(ChatError::ProviderTransport(format!(
                        "no response within {}s",
                        idle.as_secs()
                    ))),
                }
            }
        }
    }

    async fn next_event(&self, stream: &mut AnswerStream) -> ChatResult<AnswerEvent> {
        let idle = self.service.settings.idle_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChatError::Cancelled),
            item = tokio::time::timeout(idle, stream.next()) => match item {
                Ok(Some(Ok(event))) => Ok(event),
                Ok(Some(Err(e))) => Err(e.into()),
                Ok(None) => Err(ChatError::ProviderTransport(
                    "answer stream ended before completion".to_string(),
                )),
                Err(_) => Err(ChatError::ProviderTransport(format!(
                    "no event within {}s",
                    idle.as_secs()
                ))),
            },
        }
    }

    fn run(self, text: String, ticket: GateTicket) -> ChatStream {
        let mut controller = self;

        Box::pin(async_stream::stream! {
            let service = controller.service.clone();
            let session_id = controller.session_id.clone();

            if let Err(error) = service.validate(&text) {
                drop(ticket);
                yield controller.fail(error);
                return;
            }

            let gate = tokio::select! {
                biased;
                _ = controller.cancel.cancelled() => None,
                guard = ticket.acquire() => Some(guard),
            };
            let _gate = match gate {
                Some(guard) => guard,
                None => {
                    yield controller.fail(ChatError::Cancelled);
                    return;
                }
            };

            let user_message = match service.store.append_message(&session_id, NewMessage::user(text.clone())).await {
                Ok(message) => message,
                Err(e) => {
                    yield controller.fail(e.into());
                    return;
                }
            };

            let messages = match service.store.list_messages(&session_id, None).await {
                Ok(messages) => messages,
                Err(e) => {
                    yield controller.fail(e.into());
                    return;
                }
            };
            let request = AnswerRequest {
                query: text,
                history: service.history.build(&messages, &user_message),
                session_id: session_id.clone(),
            };

            controller.transition(ControllerState::ProviderInvoked);
            let mut answer = match controller.open(request).await {
                Ok(stream) => stream,
                Err(error) => {
                    yield controller.fail(error);
                    return;
                }
            };
            controller.transition(ControllerState::Streaming);

            let mut assembled = String::new();
            let mut chunks = 0usize;
            let completion = loop {
                match controller.next_event(&mut answer).await {
                    Ok(AnswerEvent::Delta { text }) => {
                        if text.is_empty() {
                            continue;
                        }
                        assembled.push_str(&text);
                        chunks += 1;
                        yield ChatEvent::Chunk {
                            session_id: session_id.clone(),
                            content: text,
                        };
                    }
                    Ok(AnswerEvent::Done(completion)) => break completion,
                    Err(error) => {
                        yield controller.fail(error);
                        return;
                    }
                }
            };
            drop(answer);

            // A provider that only reports the final text is delivered as one chunk.
            if chunks == 0 && !completion.final_text.is_empty() {
                assembled = completion.final_text.clone();
                chunks = 1;
                yield ChatEvent::Chunk {
                    session_id: session_id.clone(),
                    content: completion.final_text.clone(),
                };
            }

            let draft = NewMessage::assistant(assembled, completion.sources);
            let message = match service.store.append_message(&session_id, draft).await {
                Ok(message) => message,
                Err(e) => {
                    yield controller.fail(e.into());
                    return;
                }
            };

            controller.transition(ControllerState::Completed);
            info!(
                "Chat completed: session={}, message={}, chunks={}, chars={}",
                session_id,
                message.id,
                chunks,
                message.content.len()
            );
            yield ChatEvent::Complete {
                session_id,
                message,
                usage: completion.usage,
            };
        })
    }
}
