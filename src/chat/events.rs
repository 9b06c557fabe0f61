use crate::chat::errors::ChatError;
use crate::provider::UsageMetadata;
use crate::session::Message;

/// Events produced by one chat exchange: zero or more chunks followed by
/// exactly one terminal event
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Chunk {
        session_id: String,
        content: String,
    },
    /// The assistant message has already been persisted when this is observed
    Complete {
        session_id: String,
        message: Message,
        usage: Option<UsageMetadata>,
    },
    Failed {
        session_id: String,
        error: ChatError,
    },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatEvent::Chunk { .. })
    }
}
