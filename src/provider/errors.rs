//! Error types for answer providers

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network failure, timeout or server-side fault
    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Provider rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Rejected request that will not succeed on retry
    #[error("Provider invocation error: {0}")]
    Invocation(String),

    #[error("Invalid provider configuration: {0}")]
    Config(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: &str, retry_after_secs: Option<u64>) -> Self {
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body.trim())
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited {
                message,
                retry_after_secs,
            }
        } else if status.is_client_error() {
            ProviderError::Invocation(message)
        } else {
            ProviderError::Transport(message)
        }
    }

    /// Classify an error kind reported in-band by the provider stream
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "throttling" | "rate_limited" | "ThrottlingException" => ProviderError::RateLimited {
                message,
                retry_after_secs: None,
            },
            "transport" | "timeout" | "service_unavailable" | "ServiceUnavailableException" => {
                ProviderError::Transport(message)
            }
            _ => ProviderError::Invocation(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProviderError::from_status(status, "", None),
            None if err.is_decode() || err.is_builder() => ProviderError::Invocation(err.to_string()),
            None => ProviderError::Transport(err.to_string()),
        }
    }
}
