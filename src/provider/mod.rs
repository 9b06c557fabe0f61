//! Answer provider abstraction and implementations
//!
//! The answer provider is the external retrieve-and-generate service. This
//! module defines the streaming contract the chat layer consumes and the
//! concrete clients that implement it.

pub mod echo;
pub mod errors;
pub mod knowledge_base;
pub mod provider;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use errors::{ProviderError, ProviderResult};
pub use provider::{AnswerProvider, ProviderClientOptions, ProviderFactory};
pub use types::{AnswerCompletion, AnswerEvent, AnswerRequest, AnswerStream, PriorTurn, UsageMetadata};
