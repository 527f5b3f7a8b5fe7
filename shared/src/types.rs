//! Core types used throughout the completion routing system

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::SharedError;

/// Completion providers available to the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Low-latency provider subject to busy detection
    Primary,
    /// Fallback provider served through the credential pool
    Secondary,
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderId::Primary => write!(f, "primary"),
            ProviderId::Secondary => write!(f, "secondary"),
        }
    }
}

impl std::str::FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(ProviderId::Primary),
            "secondary" => Ok(ProviderId::Secondary),
            _ => Err(format!("Unknown provider: {s}")),
        }
    }
}

/// Unique identifier for a completion request
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(format!("req_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(s: &str) -> Result<Self, SharedError> {
        let valid = s
            .strip_prefix("req_")
            .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or(false);
        if !valid {
            return Err(SharedError::InvalidId { input: s.to_string() });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request priority in `1..=10`; higher is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    /// Build a priority, clamping out-of-range values into `1..=10`
    pub fn new(value: u8) -> Self {
        Self(value.clamp(Self::MIN.0, Self::MAX.0))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Sort key for a priority queue entry: lower scores are dequeued first.
    ///
    /// Equal priorities fall back to submission order.
    pub fn queue_score(self, submitted_at_ms: i64, weight_ms: u64) -> f64 {
        submitted_at_ms as f64 + f64::from(Self::MAX.0 - self.0) * weight_ms as f64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(5)
    }
}

impl TryFrom<u8> for Priority {
    type Error = SharedError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SharedError::InvalidConfig {
                field: "priority".to_string(),
                value: value.to_string(),
            })
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single role-tagged chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Structured-output mode requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// A unit of completion work. Treated as immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub id: RequestId,
    pub messages: Vec<ChatMessage>,
    /// Overrides the provider's configured model when set
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub response_format: Option<ResponseFormat>,
    pub priority: Priority,
    /// Free-form correlation tag used in logs
    pub label: Option<String>,
}

impl CompletionRequest {
    pub const DEFAULT_MAX_TOKENS: u32 = 2000;
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            id: RequestId::new(),
            messages,
            model: None,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            temperature: Self::DEFAULT_TEMPERATURE,
            response_format: None,
            priority: Priority::default(),
            label: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label for log lines, falling back to the request id
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Token usage information for completion requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Outcome of a completion request, whichever path produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub request_id: RequestId,
    pub provider: ProviderId,
    pub model: String,
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub retry_count: u32,
}

impl CompletionResult {
    pub fn succeeded(
        request_id: RequestId,
        provider: ProviderId,
        model: impl Into<String>,
        content: impl Into<String>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            request_id,
            provider,
            model: model.into(),
            content: content.into(),
            usage,
            success: true,
            error: None,
            elapsed_ms: 0,
            retry_count: 0,
        }
    }

    pub fn failed(
        request_id: RequestId,
        provider: ProviderId,
        model: impl Into<String>,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            request_id,
            provider,
            model: model.into(),
            content: String::new(),
            usage: None,
            success: false,
            error: Some(error.to_string()),
            elapsed_ms: 0,
            retry_count: 0,
        }
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// How a provider failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 429 or provider rate-limit code; retry elsewhere and cool the credential down
    RateLimited,
    /// 5xx, timeouts and dropped connections; retry with backoff
    Transient,
    /// Malformed request or auth failure; surface immediately
    NonRetryable,
}

/// API failure types for error handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiFailure {
    RateLimitExceeded,
    ServiceUnavailable,
    ServerError(String),
    NetworkTimeout,
    NetworkError(String),
    AuthenticationFailed,
    InvalidRequest(String),
}

impl ApiFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            ApiFailure::RateLimitExceeded => FailureClass::RateLimited,
            ApiFailure::ServiceUnavailable
            | ApiFailure::ServerError(_)
            | ApiFailure::NetworkTimeout
            | ApiFailure::NetworkError(_) => FailureClass::Transient,
            ApiFailure::AuthenticationFailed | ApiFailure::InvalidRequest(_) => FailureClass::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != FailureClass::NonRetryable
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiFailure::RateLimitExceeded => write!(f, "rate limit exceeded"),
            ApiFailure::ServiceUnavailable => write!(f, "service temporarily unavailable"),
            ApiFailure::ServerError(status) => write!(f, "server error: {status}"),
            ApiFailure::NetworkTimeout => write!(f, "network timeout"),
            ApiFailure::NetworkError(message) => write!(f, "network error: {message}"),
            ApiFailure::AuthenticationFailed => write!(f, "authentication failed"),
            ApiFailure::InvalidRequest(message) => write!(f, "invalid request: {message}"),
        }
    }
}
