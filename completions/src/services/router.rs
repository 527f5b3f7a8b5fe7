//! Primary/secondary completion router with a deferred priority queue
//!
//! Requests try the primary provider first while its queue is shallow. A
//! retryable primary failure parks the request in a priority-ordered queue
//! which a background batch processor drains; the caller waits for the
//! queued outcome up to a ceiling and falls back to the secondary pool when
//! the ceiling passes. Non-retryable failures and a busy primary go straight
//! to the secondary pool.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use shared::logging::{log_shutdown, log_startup};
use shared::{
    component_debug, component_error, component_info, component_warn, ApiFailure, Clock, Component,
    CompletionRequest, CompletionResult, KeyValueStore, ProviderId,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RouterConfig;
use crate::error::RouterResult;
use crate::services::key_pool::KeyPool;
use crate::traits::{ChatClient, CompletionService};
use crate::types::{QueueStats, QueuedRequest};

/// Value held at a result key until the batch processor writes the outcome
pub const PENDING_MARKER: &str = "PENDING";

/// The primary provider: one client with one credential
pub struct PrimaryProvider {
    pub client: Arc<dyn ChatClient>,
    pub api_key: String,
    pub model: String,
}

impl PrimaryProvider {
    pub fn new(client: Arc<dyn ChatClient>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

struct RouterCore {
    primary: Option<PrimaryProvider>,
    pool: Arc<KeyPool>,
    store: Arc<dyn KeyValueStore>,
    config: RouterConfig,
    clock: Arc<dyn Clock>,
}

struct BatchProcessor {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Routes completions between the primary provider and the credential pool
pub struct ProviderRouter {
    core: Arc<RouterCore>,
    processor: Mutex<Option<BatchProcessor>>,
}

impl ProviderRouter {
    pub fn new(
        primary: Option<PrimaryProvider>,
        pool: Arc<KeyPool>,
        store: Arc<dyn KeyValueStore>,
        config: RouterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if primary.is_none() {
            component_info!(Component::Router, "No primary provider configured, all requests use the secondary pool");
        }

        Self {
            core: Arc::new(RouterCore {
                primary,
                pool,
                store,
                config,
                clock,
            }),
            processor: Mutex::new(None),
        }
    }

    /// Start the background batch processor. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut processor = self.processor.lock().await;
        if processor.is_some() {
            return;
        }
        if self.core.primary.is_none() {
            component_debug!(Component::DeferredQueue, "Batch processor not started, no primary provider");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let core = Arc::clone(&self.core);
        let interval = self.core.config.batch_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = core.process_queue_batch().await {
                            component_error!(Component::DeferredQueue, "Batch processing failed: {}", e);
                        }
                    }
                }
            }
        });

        log_startup(Component::DeferredQueue, "deferred queue batch processor");
        *processor = Some(BatchProcessor { shutdown_tx, handle });
    }

    /// Stop the batch processor and wait for the running batch to finish
    pub async fn stop(&self) {
        let Some(processor) = self.processor.lock().await.take() else {
            return;
        };

        let _ = processor.shutdown_tx.send(()).await;
        if let Err(e) = processor.handle.await {
            component_warn!(Component::DeferredQueue, "Batch processor task ended abnormally: {}", e);
        }
        log_shutdown(Component::DeferredQueue, "stop requested");
    }

    pub async fn is_running(&self) -> bool {
        self.processor.lock().await.is_some()
    }

    pub async fn complete(&self, request: CompletionRequest) -> CompletionResult {
        self.core.complete(request).await
    }

    /// Complete several requests concurrently, results in input order.
    ///
    /// When the primary is busy up front the whole batch goes to the pool.
    pub async fn complete_many(&self, requests: Vec<CompletionRequest>) -> Vec<CompletionResult> {
        let busy = self.core.primary.is_none() || self.core.queue_stats().await.is_busy;

        if busy {
            component_info!(Component::Router, "Routing batch of {} directly to the secondary pool", requests.len());
            join_all(requests.iter().map(|request| self.core.fallback(request, Instant::now(), 0))).await
        } else {
            join_all(requests.into_iter().map(|request| self.core.complete(request))).await
        }
    }

    /// Claim and run up to `batch_size` queued requests. Returns how many ran.
    pub async fn process_queue_batch(&self) -> RouterResult<usize> {
        self.core.process_queue_batch().await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.core.queue_stats().await
    }

    /// Whether a primary exists and its queue is below the busy threshold
    pub async fn is_primary_available(&self) -> bool {
        self.core.primary.is_some() && !self.core.queue_stats().await.is_busy
    }

    /// Drop every queued and in-flight marker
    pub async fn clear_queue(&self) -> RouterResult<()> {
        self.core.store.del(&self.core.config.queue_key).await?;
        self.core.store.del(&self.core.config.processing_key).await?;
        component_info!(Component::DeferredQueue, "Queue cleared");
        Ok(())
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.core.pool
    }
}

impl Drop for ProviderRouter {
    fn drop(&mut self) {
        if let Some(processor) = self.processor.get_mut().take() {
            processor.handle.abort();
        }
    }
}

#[async_trait]
impl CompletionService for ProviderRouter {
    async fn complete(&self, request: CompletionRequest) -> CompletionResult {
        self.core.complete(request).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl RouterCore {
    async fn complete(&self, request: CompletionRequest) -> CompletionResult {
        let started = Instant::now();

        let Some(primary) = self.primary.as_ref() else {
            return self.fallback(&request, started, 0).await;
        };

        let stats = self.queue_stats().await;
        if stats.is_busy {
            component_info!(
                Component::Router,
                "Primary busy ({} queued, {} in flight), routing {} to secondary",
                stats.queued,
                stats.processing,
                request.display_label()
            );
            return self.fallback(&request, started, 0).await;
        }

        match self.call_primary(primary, &request).await {
            Ok(result) => {
                component_debug!(Component::Router, "Primary completed {}", request.display_label());
                result.with_elapsed_ms(elapsed_ms(started))
            }
            Err(failure) if failure.is_retryable() && self.config.primary_max_retries > 0 => {
                component_warn!(
                    Component::Router,
                    "Primary failed for {} ({}), deferring",
                    request.display_label(),
                    failure
                );
                self.enqueue_and_wait(request, started).await
            }
            Err(failure) => {
                component_warn!(
                    Component::Router,
                    "Primary failed for {} ({}), falling back",
                    request.display_label(),
                    failure
                );
                self.fallback(&request, started, 1).await
            }
        }
    }

    /// One primary call bounded by the primary timeout, tracked in the in-flight set
    async fn call_primary(
        &self,
        primary: &PrimaryProvider,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, ApiFailure> {
        let member = request.id.as_str();
        if let Err(e) = self.store.sadd(&self.config.processing_key, member).await {
            component_warn!(Component::Router, "Failed to mark {} in flight: {}", member, e);
        }

        let outcome = match tokio::time::timeout(
            self.config.primary_timeout,
            primary.client.chat(&primary.api_key, request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiFailure::NetworkTimeout),
        };

        if let Err(e) = self.store.srem(&self.config.processing_key, member).await {
            component_warn!(Component::Router, "Failed to clear in-flight marker for {}: {}", member, e);
        }

        outcome.map(|response| {
            CompletionResult::succeeded(
                request.id.clone(),
                ProviderId::Primary,
                response.model,
                response.content,
                response.usage,
            )
        })
    }

    async fn enqueue_and_wait(&self, request: CompletionRequest, started: Instant) -> CompletionResult {
        let entry = QueuedRequest {
            request: request.clone(),
            retry_count: 1,
            enqueued_at_ms: self.clock.now_ms(),
        };
        let member = match serde_json::to_string(&entry) {
            Ok(member) => member,
            Err(e) => {
                component_error!(Component::DeferredQueue, "Failed to serialize {}: {}", request.display_label(), e);
                return self.fallback(&request, started, 1).await;
            }
        };
        let result_key = self.config.result_key(&request.id);
        let score = request
            .priority
            .queue_score(entry.enqueued_at_ms, self.config.priority_weight_ms);

        // Result key first so the processor never writes to a key nobody watches
        if let Err(e) = self
            .store
            .set_ex(&result_key, PENDING_MARKER, self.config.result_ttl)
            .await
        {
            component_error!(Component::DeferredQueue, "Failed to create result slot: {}", e);
            return self.fallback(&request, started, 1).await;
        }
        if let Err(e) = self.store.zadd(&self.config.queue_key, score, &member).await {
            component_error!(Component::DeferredQueue, "Failed to enqueue {}: {}", request.display_label(), e);
            let _ = self.store.del(&result_key).await;
            return self.fallback(&request, started, 1).await;
        }

        component_info!(
            Component::DeferredQueue,
            "Queued {} with priority {}",
            request.display_label(),
            request.priority
        );

        match self.wait_for_result(&result_key).await {
            Some(result) if result.success => {
                let _ = self.store.del(&result_key).await;
                result.with_elapsed_ms(elapsed_ms(started))
            }
            Some(result) => {
                let _ = self.store.del(&result_key).await;
                component_warn!(
                    Component::DeferredQueue,
                    "Deferred primary call failed for {}: {}",
                    request.display_label(),
                    result.error.as_deref().unwrap_or("unknown error")
                );
                self.fallback(&request, started, result.retry_count + 1).await
            }
            None => {
                component_warn!(
                    Component::DeferredQueue,
                    "Timed out waiting on queue for {}, falling back",
                    request.display_label()
                );
                if let Err(e) = self.store.zrem(&self.config.queue_key, &member).await {
                    component_warn!(Component::DeferredQueue, "Failed to withdraw {}: {}", request.display_label(), e);
                }
                let _ = self.store.del(&result_key).await;
                self.fallback(&request, started, 1).await
            }
        }
    }

    /// Poll the result key until it holds an outcome or the wait ceiling passes
    async fn wait_for_result(&self, result_key: &str) -> Option<CompletionResult> {
        let deadline = Instant::now() + self.config.max_wait;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            match self.store.get(result_key).await {
                Ok(Some(value)) if value != PENDING_MARKER => {
                    return match serde_json::from_str::<CompletionResult>(&value) {
                        Ok(result) => Some(result),
                        Err(e) => {
                            component_error!(Component::DeferredQueue, "Unreadable result at {}: {}", result_key, e);
                            None
                        }
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    component_warn!(Component::DeferredQueue, "Polling {} failed: {}", result_key, e);
                }
            }
        }
    }

    async fn fallback(&self, request: &CompletionRequest, started: Instant, prior_attempts: u32) -> CompletionResult {
        component_debug!(Component::Router, "Sending {} to the secondary pool", request.display_label());

        match self.pool.call(request).await {
            Ok(result) => {
                let retry_count = result.retry_count + prior_attempts;
                result
                    .with_elapsed_ms(elapsed_ms(started))
                    .with_retry_count(retry_count)
            }
            Err(e) => {
                component_error!(Component::Router, "Secondary pool failed for {}: {}", request.display_label(), e);
                CompletionResult::failed(
                    request.id.clone(),
                    ProviderId::Secondary,
                    self.pool.model(),
                    e,
                )
                .with_elapsed_ms(elapsed_ms(started))
                .with_retry_count(prior_attempts)
            }
        }
    }

    async fn queue_stats(&self) -> QueueStats {
        let queued = self.store.zcard(&self.config.queue_key).await;
        let processing = self.store.scard(&self.config.processing_key).await;

        match (queued, processing) {
            (Ok(queued), Ok(processing)) => {
                let total = queued + processing;
                QueueStats {
                    queued,
                    processing,
                    total,
                    is_busy: total >= self.config.busy_threshold,
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                component_warn!(Component::Router, "Queue depth unavailable, treating primary as busy: {}", e);
                QueueStats {
                    queued: 0,
                    processing: 0,
                    total: 0,
                    is_busy: true,
                }
            }
        }
    }

    async fn process_queue_batch(&self) -> RouterResult<usize> {
        let Some(primary) = self.primary.as_ref() else {
            return Ok(0);
        };

        let stop = self.config.batch_size.max(1) - 1;
        let batch = self.store.zrange(&self.config.queue_key, 0, stop).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        component_debug!(Component::DeferredQueue, "Processing batch of {} queued requests", batch.len());

        let processed = join_all(batch.into_iter().map(|member| self.process_queued(primary, member))).await;
        Ok(processed.into_iter().filter(|ran| *ran).count())
    }

    /// Push a failed entry back for another deferred attempt, scored as a fresh arrival
    async fn requeue(&self, entry: &QueuedRequest) -> RouterResult<()> {
        let next = QueuedRequest {
            request: entry.request.clone(),
            retry_count: entry.retry_count + 1,
            enqueued_at_ms: self.clock.now_ms(),
        };
        let member = serde_json::to_string(&next)?;
        let score = next
            .request
            .priority
            .queue_score(next.enqueued_at_ms, self.config.priority_weight_ms);
        self.store.zadd(&self.config.queue_key, score, &member).await?;
        Ok(())
    }

    async fn process_queued(&self, primary: &PrimaryProvider, member: String) -> bool {
        // Removal is the claim; a false here means a waiter withdrew it or another worker took it
        match self.store.zrem(&self.config.queue_key, &member).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                component_error!(Component::DeferredQueue, "Failed to claim queued request: {}", e);
                return false;
            }
        }

        let entry: QueuedRequest = match serde_json::from_str(&member) {
            Ok(entry) => entry,
            Err(e) => {
                component_error!(Component::DeferredQueue, "Dropping malformed queue entry: {}", e);
                return false;
            }
        };

        let request = &entry.request;
        let result = match self.call_primary(primary, request).await {
            Ok(result) => result,
            Err(failure) if failure.is_retryable() && entry.retry_count < self.config.primary_max_retries => {
                component_warn!(
                    Component::DeferredQueue,
                    "Queued primary call failed for {} ({}), requeueing attempt {}/{}",
                    request.display_label(),
                    failure,
                    entry.retry_count + 1,
                    self.config.primary_max_retries
                );
                match self.requeue(&entry).await {
                    Ok(()) => return true,
                    Err(e) => {
                        component_error!(Component::DeferredQueue, "Failed to requeue {}: {}", request.display_label(), e);
                        CompletionResult::failed(
                            request.id.clone(),
                            ProviderId::Primary,
                            request.model.clone().unwrap_or_else(|| primary.model.clone()),
                            failure,
                        )
                    }
                }
            }
            Err(failure) => {
                component_warn!(
                    Component::DeferredQueue,
                    "Queued primary call failed for {}: {}",
                    request.display_label(),
                    failure
                );
                CompletionResult::failed(
                    request.id.clone(),
                    ProviderId::Primary,
                    request.model.clone().unwrap_or_else(|| primary.model.clone()),
                    failure,
                )
            }
        }
        .with_retry_count(entry.retry_count);

        let result_key = self.config.result_key(&request.id);
        match serde_json::to_string(&result) {
            Ok(json) => {
                if let Err(e) = self.store.set_ex(&result_key, &json, self.config.result_ttl).await {
                    component_error!(Component::DeferredQueue, "Failed to publish result for {}: {}", request.display_label(), e);
                }
            }
            Err(e) => {
                component_error!(Component::DeferredQueue, "Failed to serialize result: {}", e);
            }
        }

        true
    }
}
