//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use completions::CompletionService;
use pipeline::{ContentConfig, JobConfig, Pipeline, PipelineConfig, Stage};
use shared::{
    CompletionRequest, CompletionResult, InMemoryStore, KeyValueStore, ManualClock, Priority, ProviderId, StoreResult,
};

/// Completion service answering each stage with canned JSON
pub struct StageScriptedService {
    failing: Mutex<HashSet<Stage>>,
    malformed: Mutex<HashSet<Stage>>,
    delay: Duration,
    calls: Mutex<Vec<(Stage, Priority)>>,
}

impl StageScriptedService {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(HashSet::new()),
            malformed: Mutex::new(HashSet::new()),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_stage(&self, stage: Stage) {
        self.failing.lock().unwrap().insert(stage);
    }

    pub fn heal_stage(&self, stage: Stage) {
        self.failing.lock().unwrap().remove(&stage);
    }

    pub fn malform_stage(&self, stage: Stage) {
        self.malformed.lock().unwrap().insert(stage);
    }

    pub fn calls(&self) -> Vec<(Stage, Priority)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: Stage) -> usize {
        self.calls().iter().filter(|(s, _)| *s == stage).count()
    }

    fn canned(stage: Stage) -> &'static str {
        match stage {
            Stage::Select => {
                r#"{"theme_id":"t-1","theme_title":"Morning focus","angle":"habits","content_hash":"hash-1"}"#
            }
            Stage::Research => r#"{"insights":["short focus blocks beat long ones"]}"#,
            Stage::Write => r#"{"title":"Own your morning","body":"draft body"}"#,
            Stage::Optimize => r#"{"title":"Own your morning","body":"optimized body","seo_score":88}"#,
            Stage::Validate => r#"{"valid":true,"issues":[]}"#,
        }
    }
}

#[async_trait]
impl CompletionService for StageScriptedService {
    async fn complete(&self, request: CompletionRequest) -> CompletionResult {
        let stage = request
            .label
            .as_deref()
            .and_then(|label| label.rsplit(':').next())
            .and_then(|name| name.parse::<Stage>().ok())
            .expect("pipeline requests carry a job:stage label");
        self.calls.lock().unwrap().push((stage, request.priority));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.lock().unwrap().contains(&stage) {
            return CompletionResult::failed(request.id, ProviderId::Secondary, "fake", "pool exhausted");
        }
        let content = if self.malformed.lock().unwrap().contains(&stage) {
            "this is not json"
        } else {
            Self::canned(stage)
        };
        CompletionResult::succeeded(request.id, ProviderId::Primary, "fake", content, None)
    }
}

/// In-memory store that records every sorted-set insert
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryStore,
    zadds: Mutex<Vec<(String, f64, String)>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn zadds(&self) -> Vec<(String, f64, String)> {
        self.zadds.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyValueStore for RecordingStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.zadds
            .lock()
            .unwrap()
            .push((key.to_string(), score, member.to_string()));
        self.inner.zadd(key, score, member).await
    }

    async fn zrange(&self, key: &str, start: usize, stop: usize) -> StoreResult<Vec<String>> {
        self.inner.zrange(key, start, stop).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.zrem(key, member).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.inner.zcard(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.srem(key, member).await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.sismember(key, member).await
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        self.inner.scard(key).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.inner.del(key).await
    }
}

pub fn job_config() -> JobConfig {
    JobConfig::new(ContentConfig::new("productivity", "founders"))
}

pub fn build_pipeline(
    service: Arc<StageScriptedService>,
    store: Arc<dyn KeyValueStore>,
    config: PipelineConfig,
) -> Pipeline {
    Pipeline::new(service, store, config, Arc::new(ManualClock::default()))
}

/// Run every stage's batch until nothing is left to claim
pub async fn drain(pipeline: &Pipeline) {
    loop {
        let mut ran = 0;
        for stage in Stage::ALL {
            ran += pipeline.process_stage_batch(stage).await.unwrap();
        }
        if ran == 0 {
            break;
        }
    }
}
