//! OpenAI-compatible chat completion client

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use shared::{ApiFailure, CompletionRequest, ResponseFormat, TokenUsage};

use crate::config::ProviderSettings;
use crate::error::{RouterError, RouterResult};
use crate::traits::ChatClient;
use crate::types::ProviderResponse;

/// HTTP client for any `/chat/completions` endpoint speaking the OpenAI wire format
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Option<Duration>,
    ) -> RouterResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| RouterError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            default_model: default_model.into(),
        })
    }

    pub fn from_settings(settings: &ProviderSettings) -> RouterResult<Self> {
        Self::new(&settings.base_url, &settings.model, Some(settings.request_timeout))
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        if let Some(ResponseFormat::JsonObject) = request.response_format {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        body
    }

    /// Map a non-success HTTP status and its body to a failure kind
    pub(crate) fn classify_status(status: u16, body: &str) -> ApiFailure {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let error = parsed.as_ref().and_then(|json| json.get("error"));
        let code = error
            .and_then(|e| e.get("code").or_else(|| e.get("type")))
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.chars().take(200).collect());

        match code {
            "rate_limit_exceeded" => return ApiFailure::RateLimitExceeded,
            "temporarily_unavailable" => return ApiFailure::ServiceUnavailable,
            _ => {}
        }

        match status {
            401 | 403 => ApiFailure::AuthenticationFailed,
            408 => ApiFailure::NetworkTimeout,
            429 => ApiFailure::RateLimitExceeded,
            503 => ApiFailure::ServiceUnavailable,
            500..=599 => ApiFailure::ServerError(format!("HTTP {}: {}", status, message)),
            _ => ApiFailure::InvalidRequest(format!("HTTP {}: {}", status, message)),
        }
    }

    fn parse_response(&self, json: &Value, response_time: Duration) -> Result<ProviderResponse, ApiFailure> {
        let content = json
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| ApiFailure::InvalidRequest("No content in response".to_string()))?;

        let usage = json.get("usage").map(|u| TokenUsage {
            input_tokens: u.get("prompt_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
            output_tokens: u.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
        });

        let model = json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.default_model)
            .to_string();

        Ok(ProviderResponse {
            content: content.to_string(),
            model,
            usage,
            response_time,
        })
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatibleClient {
    async fn chat(&self, api_key: &str, request: &CompletionRequest) -> Result<ProviderResponse, ApiFailure> {
        let request_start = std::time::Instant::now();

        let response = self
            .http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiFailure::NetworkTimeout
                } else {
                    ApiFailure::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), &body));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| ApiFailure::InvalidRequest(format!("Failed to parse response: {}", e)))?;

        self.parse_response(&response_json, request_start.elapsed())
    }
}
