//! Error types for the session store

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
