//! Router configuration
//!
//! Tunables default to the values the router is designed around; provider
//! endpoints and credentials are read from the environment.
//!
//! ## Configuration Sources
//! Provider settings are loaded from:
//! 1. `.env` file in the current directory or parent directories (if present)
//! 2. System environment variables
//!
//! Environment variables take precedence over .env file values.
//!
//! ## Keys
//! - `PRIMARY_API_KEY` (optional; without it every request uses the pool)
//! - `PRIMARY_BASE_URL`, `PRIMARY_MODEL`
//! - `SECONDARY_API_KEY`, `SECONDARY_API_KEY_1`, `SECONDARY_API_KEY_2` (at least one required)
//! - `SECONDARY_BASE_URL`, `SECONDARY_MODEL`

use std::time::Duration;

use shared::RequestId;

use crate::error::{RouterError, RouterResult};

/// Credential pool tunables
#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    /// Attempts per call, across credentials
    pub max_retries: u32,
    /// Errors in a row before a credential is skipped
    pub max_consecutive_errors: u32,
    pub rate_limit_cooldown: Duration,
    /// Backoff after a transient failure is `backoff_step * attempt`
    pub backoff_step: Duration,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_consecutive_errors: 3,
            rate_limit_cooldown: Duration::from_secs(60),
            backoff_step: Duration::from_millis(1000),
        }
    }
}

/// Primary/secondary routing tunables
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Queued plus in-flight requests at which the primary counts as busy
    pub busy_threshold: usize,
    pub primary_timeout: Duration,
    /// Deferred attempts allowed after a retryable fast-path failure
    pub primary_max_retries: u32,
    pub queue_key: String,
    pub processing_key: String,
    pub result_key_prefix: String,
    pub priority_weight_ms: u64,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub result_ttl: Duration,
}

impl RouterConfig {
    pub fn result_key(&self, request_id: &RequestId) -> String {
        format!("{}{}", self.result_key_prefix, request_id)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            busy_threshold: 20,
            primary_timeout: Duration::from_secs(30),
            primary_max_retries: 2,
            queue_key: "primary:queue".to_string(),
            processing_key: "primary:processing".to_string(),
            result_key_prefix: "primary:result:".to_string(),
            priority_weight_ms: 1000,
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(120),
            batch_size: 10,
            batch_interval: Duration::from_millis(500),
            result_ttl: Duration::from_secs(300),
        }
    }
}

/// Endpoint, model and credentials for one provider
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
    pub api_keys: Vec<String>,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub const PRIMARY_DEFAULT_BASE_URL: &'static str = "https://api.z.ai/v1";
    pub const PRIMARY_DEFAULT_MODEL: &'static str = "glm-4.7";
    pub const SECONDARY_DEFAULT_BASE_URL: &'static str = "https://api.groq.com/openai/v1";
    pub const SECONDARY_DEFAULT_MODEL: &'static str = "llama-3.3-70b-versatile";

    const SECONDARY_KEY_NAMES: &'static [&'static str] =
        &["SECONDARY_API_KEY", "SECONDARY_API_KEY_1", "SECONDARY_API_KEY_2"];

    /// Initialize environment by loading .env file if present
    fn init_env() {
        // Silently ignored when no .env file exists
        let _ = dotenv::dotenv();
    }

    fn lookup_env(name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    /// Primary settings, or `None` when no primary key is configured
    pub fn primary_from_env() -> Option<Self> {
        Self::init_env();
        Self::primary_from_lookup(Self::lookup_env)
    }

    /// Secondary settings; at least one key is required
    pub fn secondary_from_env() -> RouterResult<Self> {
        Self::init_env();
        Self::secondary_from_lookup(Self::lookup_env)
    }

    pub fn primary_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let api_key = lookup("PRIMARY_API_KEY").filter(|key| !key.trim().is_empty())?;
        Some(Self {
            base_url: lookup("PRIMARY_BASE_URL").unwrap_or_else(|| Self::PRIMARY_DEFAULT_BASE_URL.to_string()),
            model: lookup("PRIMARY_MODEL").unwrap_or_else(|| Self::PRIMARY_DEFAULT_MODEL.to_string()),
            api_keys: vec![api_key],
            request_timeout: RouterConfig::default().primary_timeout,
        })
    }

    pub fn secondary_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RouterResult<Self> {
        let api_keys: Vec<String> = Self::SECONDARY_KEY_NAMES
            .iter()
            .filter_map(|name| lookup(name))
            .filter(|key| !key.trim().is_empty())
            .collect();

        if api_keys.is_empty() {
            return Err(RouterError::config(format!(
                "Missing secondary API keys: set at least one of {}",
                Self::SECONDARY_KEY_NAMES.join(", ")
            )));
        }

        Ok(Self {
            base_url: lookup("SECONDARY_BASE_URL").unwrap_or_else(|| Self::SECONDARY_DEFAULT_BASE_URL.to_string()),
            model: lookup("SECONDARY_MODEL").unwrap_or_else(|| Self::SECONDARY_DEFAULT_MODEL.to_string()),
            api_keys,
            request_timeout: Duration::from_secs(60),
        })
    }
}
