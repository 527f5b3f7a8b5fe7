//! Router trait definitions for dependency injection

use async_trait::async_trait;

use crate::types::ProviderResponse;
use shared::{ApiFailure, CompletionRequest, CompletionResult};

/// A single chat-completion endpoint, called with an explicit credential
#[mockall::automock]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Issue one chat completion with the given API key
    async fn chat(&self, api_key: &str, request: &CompletionRequest) -> Result<ProviderResponse, ApiFailure>;
}

/// Anything that turns a request into a tagged result.
///
/// Implementations never return an error; failures are reported through
/// `CompletionResult::success`.
#[mockall::automock]
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> CompletionResult;
}
