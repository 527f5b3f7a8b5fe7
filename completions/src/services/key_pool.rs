//! Secondary-provider credential pool
//!
//! Rotates calls across several API keys for the same provider. A key that
//! hits a rate limit cools down for a fixed window; a key that fails too many
//! times in a row is skipped until the whole pool is exhausted, at which point
//! the first key is forced back into service.

use std::sync::Arc;

use shared::{
    component_debug, component_info, component_warn, ApiFailure, Clock, Component, CompletionRequest,
    CompletionResult, FailureClass, ProviderId,
};
use tokio::sync::Mutex;

use crate::config::KeyPoolConfig;
use crate::error::{RouterError, RouterResult};
use crate::traits::ChatClient;
use crate::types::{CredentialHealth, PoolStats, ProviderCredential};

struct PoolState {
    credentials: Vec<ProviderCredential>,
    current_index: usize,
}

/// Round-robin pool of secondary-provider credentials
pub struct KeyPool {
    client: Arc<dyn ChatClient>,
    model: String,
    state: Mutex<PoolState>,
    config: KeyPoolConfig,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    pub fn new(
        api_keys: Vec<String>,
        client: Arc<dyn ChatClient>,
        model: impl Into<String>,
        config: KeyPoolConfig,
        clock: Arc<dyn Clock>,
    ) -> RouterResult<Self> {
        if api_keys.is_empty() {
            return Err(RouterError::config("Credential pool needs at least one API key"));
        }
        if config.max_retries == 0 {
            return Err(RouterError::config("max_retries must be at least 1"));
        }

        component_info!(Component::KeyPool, "Initialized with {} API keys", api_keys.len());

        Ok(Self {
            client,
            model: model.into(),
            state: Mutex::new(PoolState {
                credentials: api_keys.into_iter().map(ProviderCredential::new).collect(),
                current_index: 0,
            }),
            config,
            clock,
        })
    }

    /// Number of configured credentials
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    /// Model every pool call is sent with
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one completion, rotating credentials on failure.
    ///
    /// Rate limits and transient failures consume an attempt and move on to
    /// the next credential; any other failure is returned immediately. A
    /// model named on the request is replaced by the pool's own model.
    pub async fn call(&self, request: &CompletionRequest) -> RouterResult<CompletionResult> {
        let mut last_failure = ApiFailure::ServiceUnavailable;
        let request = &CompletionRequest {
            model: Some(self.model.clone()),
            ..request.clone()
        };

        for attempt in 0..self.config.max_retries {
            let (index, api_key) = self.select_credential().await;
            component_debug!(
                Component::KeyPool,
                "Attempt {}/{} for {} using key #{}",
                attempt + 1,
                self.config.max_retries,
                request.display_label(),
                index
            );

            match self.client.chat(&api_key, request).await {
                Ok(response) => {
                    self.mark_success(index).await;
                    return Ok(CompletionResult::succeeded(
                        request.id.clone(),
                        ProviderId::Secondary,
                        response.model,
                        response.content,
                        response.usage,
                    )
                    .with_elapsed_ms(response.response_time.as_millis() as u64)
                    .with_retry_count(attempt));
                }
                Err(failure) => match failure.class() {
                    FailureClass::RateLimited => {
                        component_warn!(Component::KeyPool, "Key #{} rate limited, cooling down", index);
                        self.mark_rate_limited(index).await;
                        last_failure = failure;
                    }
                    FailureClass::Transient => {
                        component_warn!(Component::KeyPool, "Key #{} transient failure: {}", index, failure);
                        self.mark_error(index).await;
                        last_failure = failure;
                        if attempt + 1 < self.config.max_retries {
                            tokio::time::sleep(self.config.backoff_step * (attempt + 1)).await;
                        }
                    }
                    FailureClass::NonRetryable => {
                        return Err(RouterError::ProviderError {
                            provider: ProviderId::Secondary,
                            reason: failure,
                        });
                    }
                },
            }
        }

        Err(RouterError::PoolExhausted {
            attempts: self.config.max_retries,
            last_failure,
        })
    }

    /// Counts of total, selectable and rate-limited credentials
    pub async fn stats(&self) -> PoolStats {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let rate_limited_keys = state
            .credentials
            .iter()
            .filter(|c| c.cooling_down(now))
            .count();
        let available_keys = state
            .credentials
            .iter()
            .filter(|c| !c.cooling_down(now) && c.consecutive_errors < self.config.max_consecutive_errors)
            .count();

        PoolStats {
            total_keys: state.credentials.len(),
            available_keys,
            rate_limited_keys,
        }
    }

    /// Per-credential health, in configuration order
    pub async fn health(&self) -> Vec<CredentialHealth> {
        let state = self.state.lock().await;
        state
            .credentials
            .iter()
            .enumerate()
            .map(|(index, c)| CredentialHealth {
                index,
                rate_limited: c.rate_limited,
                rate_limit_reset_at: c.rate_limit_reset_at,
                consecutive_errors: c.consecutive_errors,
            })
            .collect()
    }

    async fn select_credential(&self) -> (usize, String) {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let total = state.credentials.len();

        for offset in 0..total {
            let index = (state.current_index + offset) % total;
            let credential = &mut state.credentials[index];

            if credential.rate_limited && !credential.cooling_down(now) {
                credential.reset();
                component_info!(Component::KeyPool, "Key #{} cooldown expired", index);
            }

            if credential.is_selectable(self.config.max_consecutive_errors) {
                return (index, credential.api_key.clone());
            }
        }

        component_warn!(Component::KeyPool, "All {} keys unavailable, resetting key #0", total);
        state.credentials[0].reset();
        (0, state.credentials[0].api_key.clone())
    }

    async fn mark_success(&self, index: usize) {
        let mut state = self.state.lock().await;
        state.credentials[index].consecutive_errors = 0;
        state.current_index = index;
    }

    async fn mark_rate_limited(&self, index: usize) {
        let reset_at = self.clock.now()
            + chrono::Duration::from_std(self.config.rate_limit_cooldown).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut state = self.state.lock().await;
        let total = state.credentials.len();
        let credential = &mut state.credentials[index];
        credential.rate_limited = true;
        credential.rate_limit_reset_at = Some(reset_at);
        credential.consecutive_errors += 1;
        state.current_index = (index + 1) % total;
    }

    async fn mark_error(&self, index: usize) {
        let mut state = self.state.lock().await;
        let total = state.credentials.len();
        state.credentials[index].consecutive_errors += 1;
        state.current_index = (index + 1) % total;
    }
}
