//! Error taxonomy surfaced to chat clients

use thiserror::Error;

use crate::provider::ProviderError;
use crate::session::SessionError;

/// Terminal failure of a chat exchange. Every variant maps to a stable code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("The answer service is unavailable: {0}")]
    ProviderTransport(String),

    #[error("The answer service is throttling requests: {message}")]
    ProviderRateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("The answer service rejected the request: {0}")]
    ProviderInvocation(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("A request for session {0} is already in progress")]
    RequestInProgress(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ChatError::ProviderTransport(_) => "PROVIDER_TRANSPORT_ERROR",
            ChatError::ProviderRateLimited { .. } => "PROVIDER_RATE_LIMITED",
            ChatError::ProviderInvocation(_) => "PROVIDER_INVOCATION_ERROR",
            ChatError::Cancelled => "CANCELLED",
            ChatError::RequestInProgress(_) => "REQUEST_IN_PROGRESS",
        }
    }

    /// Only provider transport failures and throttling may be retried as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::ProviderTransport(_) | ChatError::ProviderRateLimited { .. }
        )
    }
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transport(message) => ChatError::ProviderTransport(message),
            ProviderError::RateLimited {
                message,
                retry_after_secs,
            } => ChatError::ProviderRateLimited {
                message,
                retry_after_secs,
            },
            ProviderError::Invocation(message) | ProviderError::Config(message) => {
                ChatError::ProviderInvocation(message)
            }
        }
    }
}

impl From<SessionError> for ChatError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ChatError::SessionNotFound(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ChatError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(ChatError::SessionNotFound("s".into()).code(), "SESSION_NOT_FOUND");
        assert_eq!(ChatError::ProviderTransport("x".into()).code(), "PROVIDER_TRANSPORT_ERROR");
        assert_eq!(ChatError::ProviderInvocation("x".into()).code(), "PROVIDER_INVOCATION_ERROR");
        assert_eq!(ChatError::Cancelled.code(), "CANCELLED");
        assert_eq!(ChatError::RequestInProgress("s".into()).code(), "REQUEST_IN_PROGRESS");
    }

    #[test]
    fn test_only_provider_availability_errors_are_retryable() {
        let rate_limited: ChatError = ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after_secs: Some(2),
        }
        .into();
        assert_eq!(rate_limited.code(), "PROVIDER_RATE_LIMITED");
        assert!(rate_limited.is_retryable());
        assert!(ChatError::from(ProviderError::Transport("down".into())).is_retryable());

        assert!(!ChatError::from(ProviderError::Invocation("bad".into())).is_retryable());
        assert!(!ChatError::Validation("empty".into()).is_retryable());
        assert!(!ChatError::Cancelled.is_retryable());
        assert!(!ChatError::from(SessionError::NotFound("s".into())).is_retryable());
    }
}
