//! Session management and conversation history
//!
//! This module provides the bounded in-memory session store and the
//! formatter that turns stored messages into provider context.

mod errors;
mod history;
mod store;
mod types;

pub use errors::{SessionError, SessionResult};
pub use history::HistoryFormatter;
pub use store::{SessionStore, StoreLimits};
pub use types::*;
