//! Tests for completion routing services
//!
//! Provider calls are replaced with scripted mocks; the store is the
//! in-memory implementation so queue behaviour is observable.

pub mod router;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::{ApiFailure, ChatMessage, CompletionRequest, TokenUsage};

use crate::traits::MockChatClient;
use crate::types::ProviderResponse;

pub fn ok_response(content: &str) -> ProviderResponse {
    ProviderResponse {
        content: content.to_string(),
        model: "test-model".to_string(),
        usage: Some(TokenUsage { input_tokens: 10, output_tokens: 5 }),
        response_time: Duration::from_millis(20),
    }
}

pub fn request(label: &str) -> CompletionRequest {
    CompletionRequest::new(vec![ChatMessage::user("hello")]).with_label(label)
}

/// Mock client answering from a per-key script; exhausted scripts answer
/// with a success echoing the key. Returns the mock and the log of keys used.
pub fn scripted_client(
    script: Vec<(&str, Vec<Result<ProviderResponse, ApiFailure>>)>,
) -> (MockChatClient, Arc<Mutex<Vec<String>>>) {
    let script: HashMap<String, VecDeque<Result<ProviderResponse, ApiFailure>>> = script
        .into_iter()
        .map(|(key, outcomes)| (key.to_string(), outcomes.into_iter().collect()))
        .collect();
    let script = Arc::new(Mutex::new(script));
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut mock = MockChatClient::new();
    let calls_log = Arc::clone(&calls);
    mock.expect_chat().returning(move |api_key, _request| {
        calls_log.lock().unwrap().push(api_key.to_string());
        script
            .lock()
            .unwrap()
            .get_mut(api_key)
            .and_then(|outcomes| outcomes.pop_front())
            .unwrap_or_else(|| Ok(ok_response(&format!("served by {api_key}"))))
    });

    (mock, calls)
}
