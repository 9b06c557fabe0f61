//! Builds bounded prior-turn context for the answer provider

use crate::provider::PriorTurn;
use crate::session::types::Message;

/// Selects the recent conversational window passed to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryFormatter {
    /// Number of user/assistant turns kept; each turn is two messages
    pub max_turns: usize,
    /// Upper bound on the JSON-serialized size of the context
    pub max_chars: usize,
}

impl Default for HistoryFormatter {
    fn default() -> Self {
        Self {
            max_turns: 3,
            max_chars: 8000,
        }
    }
}

impl HistoryFormatter {
    pub fn new(max_turns: usize, max_chars: usize) -> Self {
        Self { max_turns, max_chars }
    }

    /// Prior turns for `current`, oldest first.
    ///
    /// Only messages of the same session appended before `current` are
    /// considered; `current` itself is passed to the provider separately.
    /// When the serialized context is too large, turns are dropped from the
    /// oldest end first.
    pub fn build(&self, messages: &[Message], current: &Message) -> Vec<PriorTurn> {
        let prior: Vec<&Message> = messages
            .iter()
            .filter(|m| m.session_id == current.session_id && m.sequence < current.sequence)
            .collect();

        let window = self.max_turns.saturating_mul(2);
        let start = prior.len().saturating_sub(window);

        let mut turns: Vec<PriorTurn> = prior[start..]
            .iter()
            .map(|m| PriorTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        while !turns.is_empty() && serialized_len(&turns) > self.max_chars {
            turns.remove(0);
        }

        turns
    }
}

fn serialized_len(turns: &[PriorTurn]) -> usize {
    serde_json::to_string(turns).map(|s| s.len()).unwrap_or(usize::MAX)
}
