//! WebSocket wire events
//!
//! Frames are JSON objects of the form `{"event": <name>, "data": {...}}`
//! with camelCase payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatError, ChatEvent};
use crate::session::{Message, Source};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequestPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Inbound client events
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatMessage(ChatMessagePayload),
    Cancel(CancelPayload),
    GetHistory(HistoryRequestPayload),
    Ping,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    /// Parse a text frame. The error is a client-facing description.
    pub fn parse(text: &str) -> Result<Self, String> {
        let frame: RawFrame =
            serde_json::from_str(text).map_err(|e| format!("Malformed frame: {}", e))?;

        let data = if frame.data.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            frame.data
        };

        match frame.event.as_str() {
            "chat_message" => serde_json::from_value(data)
                .map(ClientEvent::ChatMessage)
                .map_err(|e| format!("Invalid chat_message payload: {}", e)),
            "cancel" => serde_json::from_value(data)
                .map(ClientEvent::Cancel)
                .map_err(|e| format!("Invalid cancel payload: {}", e)),
            "get_history" => serde_json::from_value(data)
                .map(ClientEvent::GetHistory)
                .map_err(|e| format!("Invalid get_history payload: {}", e)),
            "ping" => Ok(ClientEvent::Ping),
            other => Err(format!("Unknown event: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub session_id: String,
    pub content: String,
    /// Completion is signalled by `chat_response_complete`, so this is always false
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseComplete {
    pub session_id: String,
    pub message_id: String,
    pub sources: Vec<Source>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub session_id: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub session_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: DateTime<Utc>,
}

/// Outbound server events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished(ConnectionEstablished),
    ChatResponseChunk(ResponseChunk),
    ChatResponseComplete(ResponseComplete),
    ChatError(ErrorPayload),
    ChatHistory(HistoryPayload),
    Pong(Pong),
}

impl ServerEvent {
    pub fn error(session_id: impl Into<String>, error: &ChatError) -> Self {
        ServerEvent::ChatError(ErrorPayload {
            session_id: session_id.into(),
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ConnectionEstablished(p) => Some(&p.session_id),
            ServerEvent::ChatResponseChunk(p) => Some(&p.session_id),
            ServerEvent::ChatResponseComplete(p) => Some(&p.session_id),
            ServerEvent::ChatError(p) => Some(&p.session_id),
            ServerEvent::ChatHistory(p) => Some(&p.session_id),
            ServerEvent::Pong(_) => None,
        }
    }
}

impl From<ChatEvent> for ServerEvent {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::Chunk { session_id, content } => ServerEvent::ChatResponseChunk(ResponseChunk {
                session_id,
                content,
                is_final: false,
            }),
            ChatEvent::Complete {
                session_id, message, ..
            } => ServerEvent::ChatResponseComplete(ResponseComplete {
                session_id,
                message_id: message.id,
                sources: message.sources.unwrap_or_default(),
                timestamp: message.timestamp,
            }),
            ChatEvent::Failed { session_id, error } => ServerEvent::error(session_id, &error),
        }
    }
}
