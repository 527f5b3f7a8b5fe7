//! Router-specific data types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{CompletionRequest, TokenUsage};

/// Provider response data
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub response_time: Duration,
}

/// One secondary-provider API key plus its health state
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub api_key: String,
    pub rate_limited: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl ProviderCredential {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            rate_limited: false,
            rate_limit_reset_at: None,
            consecutive_errors: 0,
        }
    }

    /// Whether the credential is in cooldown at `now`
    pub fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited && self.rate_limit_reset_at.map_or(true, |reset_at| now < reset_at)
    }

    pub fn is_selectable(&self, max_consecutive_errors: u32) -> bool {
        !self.rate_limited && self.consecutive_errors < max_consecutive_errors
    }

    /// Back to a clean healthy state
    pub fn reset(&mut self) {
        self.rate_limited = false;
        self.rate_limit_reset_at = None;
        self.consecutive_errors = 0;
    }

    /// Last four characters of the key, for log lines
    pub fn masked_key(&self) -> String {
        let tail: String = self
            .api_key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("…{tail}")
    }
}

/// Credential health snapshot without the secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialHealth {
    pub index: usize,
    pub rate_limited: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

/// Aggregate credential pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_keys: usize,
    pub available_keys: usize,
    pub rate_limited_keys: usize,
}

/// Primary deferred-queue depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub total: usize,
    pub is_busy: bool,
}

/// Serialized member of the primary deferred queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub request: CompletionRequest,
    pub retry_count: u32,
    pub enqueued_at_ms: i64,
}
