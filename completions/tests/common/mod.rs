//! Shared fixtures for routing integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use completions::{ChatClient, KeyPool, KeyPoolConfig, PrimaryProvider, ProviderResponse, ProviderRouter, RouterConfig};
use shared::{ApiFailure, ChatMessage, Clock, CompletionRequest, KeyValueStore};

/// Provider double that sleeps before answering from a script
pub struct FakeProvider {
    name: String,
    delay: Duration,
    script: Mutex<VecDeque<Result<String, ApiFailure>>>,
    fallback: Result<String, ApiFailure>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn healthy(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Duration::ZERO, Ok(format!("{name} says hi"))))
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, delay, Ok(format!("{name} says hi"))))
    }

    pub fn failing(name: &str, failure: ApiFailure) -> Arc<Self> {
        Arc::new(Self::build(name, Duration::ZERO, Err(failure)))
    }

    pub fn scripted(name: &str, script: Vec<Result<String, ApiFailure>>) -> Arc<Self> {
        let provider = Self::build(name, Duration::ZERO, Ok(format!("{name} says hi")));
        *provider.script.lock().unwrap() = script.into_iter().collect();
        Arc::new(provider)
    }

    fn build(name: &str, delay: Duration, fallback: Result<String, ApiFailure>) -> Self {
        Self {
            name: name.to_string(),
            delay,
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for FakeProvider {
    async fn chat(&self, _api_key: &str, _request: &CompletionRequest) -> Result<ProviderResponse, ApiFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone()).map(|content| ProviderResponse {
            content,
            model: self.name.clone(),
            usage: None,
            response_time: self.delay,
        })
    }
}

pub fn user_request(text: &str) -> CompletionRequest {
    CompletionRequest::new(vec![ChatMessage::user(text)]).with_label(text)
}

pub fn build_router(
    primary: Option<Arc<dyn ChatClient>>,
    secondary: Arc<dyn ChatClient>,
    secondary_keys: &[&str],
    store: Arc<dyn KeyValueStore>,
    config: RouterConfig,
    clock: Arc<dyn Clock>,
) -> ProviderRouter {
    let pool = KeyPool::new(
        secondary_keys.iter().map(|k| k.to_string()).collect(),
        secondary,
        "secondary-model",
        KeyPoolConfig::default(),
        clock.clone(),
    )
    .expect("pool");
    let primary = primary.map(|client| PrimaryProvider::new(client, "primary-key", "primary-model"));
    ProviderRouter::new(primary, Arc::new(pool), store, config, clock)
}
