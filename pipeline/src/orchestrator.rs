//! Five-stage pipeline orchestrator
//!
//! Every stage has its own priority queue and in-flight set in the key/value
//! store. A poller per stage claims up to `stage_batch_size` entries per tick,
//! runs them in parallel through the completion service, persists each
//! `StageResult` and, on success, queues the job on the next stage. A failed
//! stage ends the job; resubmission is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use shared::logging::{log_shutdown, log_startup};
use shared::{
    component_debug, component_error, component_info, component_warn, Clock, Component, KeyValueStore, Priority,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use completions::CompletionService;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::prompts::{build_request, StageInputs};
use crate::types::{
    JobConfig, JobId, JobOutcome, PipelineJob, PipelineStats, Stage, StageDepth, StageOutput, StageResult, StageState,
    ValidationOutput,
};

struct PipelineCore {
    completions: Arc<dyn CompletionService>,
    store: Arc<dyn KeyValueStore>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

struct StagePollers {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Handle to the pipeline; construct once and share
pub struct Pipeline {
    core: Arc<PipelineCore>,
    pollers: Mutex<Option<StagePollers>>,
}

impl Pipeline {
    pub fn new(
        completions: Arc<dyn CompletionService>,
        store: Arc<dyn KeyValueStore>,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: Arc::new(PipelineCore {
                completions,
                store,
                config,
                clock,
            }),
            pollers: Mutex::new(None),
        }
    }

    /// Start one poller per stage. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut pollers = self.pollers.lock().await;
        if pollers.is_some() {
            return;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let handles = Stage::ALL
            .into_iter()
            .map(|stage| {
                let core = Arc::clone(&self.core);
                let mut shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(core.config.stage_poll_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = ticker.tick() => {
                                if let Err(e) = core.process_stage_batch(stage).await {
                                    component_error!(Component::Pipeline, "{} poller failed: {}", stage, e);
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        log_startup(Component::Pipeline, "stage pollers");
        *pollers = Some(StagePollers { shutdown_tx, handles });
    }

    /// Stop all pollers, letting in-progress batches finish
    pub async fn stop(&self) {
        let Some(pollers) = self.pollers.lock().await.take() else {
            return;
        };

        let _ = pollers.shutdown_tx.send(());
        for handle in pollers.handles {
            if let Err(e) = handle.await {
                component_warn!(Component::Pipeline, "Stage poller ended abnormally: {}", e);
            }
        }
        log_shutdown(Component::Pipeline, "stop requested");
    }

    pub async fn is_running(&self) -> bool {
        self.pollers.lock().await.is_some()
    }

    /// Persist a new job and queue it on SELECT
    pub async fn submit_job(
        &self,
        config: JobConfig,
        used_content_hashes: Vec<String>,
        priority: Priority,
    ) -> PipelineResult<JobId> {
        let job = PipelineJob {
            id: JobId::new(),
            stage: Stage::Select,
            config,
            used_content_hashes,
            priority,
            retry_count: 0,
            max_retries: self.core.config.max_retries,
            created_at: self.core.clock.now(),
        };

        self.core.save_job(&job).await?;
        self.core.enqueue(&job).await?;

        component_info!(
            Component::Pipeline,
            "Job {} submitted with priority {}",
            job.id,
            job.priority
        );
        Ok(job.id)
    }

    /// Claim and run up to `stage_batch_size` entries of one stage. Returns how many ran.
    pub async fn process_stage_batch(&self, stage: Stage) -> PipelineResult<usize> {
        self.core.process_stage_batch(stage).await
    }

    /// Wait for a terminal outcome with the default timeout
    pub async fn await_job(&self, job_id: &JobId) -> PipelineResult<JobOutcome> {
        self.wait_for_completion(job_id, self.core.config.default_wait_timeout)
            .await
    }

    /// Poll until VALIDATE succeeds, any stage fails, or `timeout` passes.
    ///
    /// A timeout leaves the job running; a later call can still observe it.
    pub async fn wait_for_completion(&self, job_id: &JobId, timeout: Duration) -> PipelineResult<JobOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(outcome) = self.core.terminal_outcome(job_id).await? {
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                component_debug!(Component::Pipeline, "Wait for {} timed out", job_id);
                return Ok(JobOutcome::TimedOut { job_id: job_id.clone() });
            }
            tokio::time::sleep(self.core.config.wait_poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn stage_result(&self, job_id: &JobId, stage: Stage) -> PipelineResult<Option<StageResult>> {
        self.core.stage_result(job_id, stage).await
    }

    pub async fn stage_state(&self, job_id: &JobId, stage: Stage) -> PipelineResult<StageState> {
        let core = &self.core;

        if let Some(result) = core.stage_result(job_id, stage).await? {
            return Ok(if result.success {
                StageState::Succeeded
            } else {
                StageState::Failed
            });
        }

        if core
            .store
            .sismember(&core.config.processing_key(stage), job_id.as_str())
            .await?
        {
            return Ok(StageState::Processing);
        }

        let queue_key = core.config.queue_key(stage);
        let depth = core.store.zcard(&queue_key).await?;
        if depth > 0 {
            for member in core.store.zrange(&queue_key, 0, depth - 1).await? {
                if serde_json::from_str::<PipelineJob>(&member).is_ok_and(|job| &job.id == job_id) {
                    return Ok(StageState::Queued);
                }
            }
        }

        Ok(StageState::Pending)
    }

    /// Stored job record as last queued
    pub async fn job(&self, job_id: &JobId) -> PipelineResult<Option<PipelineJob>> {
        self.core.load_job(job_id).await
    }

    pub async fn queue_stats(&self) -> PipelineResult<PipelineStats> {
        let core = &self.core;
        let mut stages = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            stages.push(StageDepth {
                stage,
                queued: core.store.zcard(&core.config.queue_key(stage)).await?,
                processing: core.store.scard(&core.config.processing_key(stage)).await?,
            });
        }
        let total = stages.iter().map(|depth| depth.queued).sum();

        Ok(PipelineStats { stages, total })
    }

    /// Re-run a job from `from_stage`, consuming one unit of its retry budget.
    ///
    /// Only a finished job (completed or failed) can be resubmitted. Every
    /// upstream stage must hold a successful result. Results from
    /// `from_stage` onward are cleared before the job is queued again.
    pub async fn resubmit(&self, job_id: &JobId, from_stage: Stage) -> PipelineResult<()> {
        let core = &self.core;
        let mut job = core
            .load_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound { job_id: job_id.clone() })?;

        if core.terminal_outcome(job_id).await?.is_none() {
            return Err(PipelineError::JobInProgress { job_id: job_id.clone() });
        }

        if job.retry_count >= job.max_retries {
            return Err(PipelineError::RetryBudgetExhausted {
                job_id: job_id.clone(),
                max_retries: job.max_retries,
            });
        }

        for &upstream in from_stage.upstream() {
            let succeeded = core
                .stage_result(job_id, upstream)
                .await?
                .is_some_and(|result| result.success);
            if !succeeded {
                return Err(PipelineError::DependencyMissing {
                    stage: from_stage,
                    missing: upstream,
                });
            }
        }

        for &stage in &Stage::ALL[from_stage.index()..] {
            core.store.del(&core.config.result_key(job_id, stage)).await?;
        }

        job.retry_count += 1;
        job.stage = from_stage;
        core.save_job(&job).await?;
        core.enqueue(&job).await?;

        component_info!(
            Component::Pipeline,
            "Job {} resubmitted from {} (retry {}/{})",
            job_id,
            from_stage,
            job.retry_count,
            job.max_retries
        );
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(pollers) = self.pollers.get_mut().take() {
            for handle in pollers.handles {
                handle.abort();
            }
        }
    }
}

impl PipelineCore {
    async fn save_job(&self, job: &PipelineJob) -> PipelineResult<()> {
        let json = serde_json::to_string(job)?;
        self.store
            .set_ex(&self.config.job_key(&job.id), &json, self.config.result_ttl)
            .await?;
        Ok(())
    }

    async fn load_job(&self, job_id: &JobId) -> PipelineResult<Option<PipelineJob>> {
        match self.store.get(&self.config.job_key(job_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Push the job onto its stage's queue, scored by priority then arrival
    async fn enqueue(&self, job: &PipelineJob) -> PipelineResult<()> {
        let member = serde_json::to_string(job)?;
        let score = job
            .priority
            .queue_score(self.clock.now_ms(), self.config.priority_weight_ms);
        self.store
            .zadd(&self.config.queue_key(job.stage), score, &member)
            .await?;
        Ok(())
    }

    async fn stage_result(&self, job_id: &JobId, stage: Stage) -> PipelineResult<Option<StageResult>> {
        match self.store.get(&self.config.result_key(job_id, stage)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_result(&self, result: &StageResult) -> PipelineResult<()> {
        let json = serde_json::to_string(result)?;
        self.store
            .set_ex(
                &self.config.result_key(&result.job_id, result.stage),
                &json,
                self.config.result_ttl,
            )
            .await?;
        Ok(())
    }

    async fn process_stage_batch(&self, stage: Stage) -> PipelineResult<usize> {
        let stop = self.config.stage_batch_size.max(1) - 1;
        let batch = self.store.zrange(&self.config.queue_key(stage), 0, stop).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        component_debug!(Component::Pipeline, "Processing {} entries in {}", batch.len(), stage);

        let ran = join_all(batch.into_iter().map(|member| self.process_entry(stage, member))).await;
        Ok(ran.into_iter().filter(|ran| *ran).count())
    }

    async fn process_entry(&self, stage: Stage, member: String) -> bool {
        let queue_key = self.config.queue_key(stage);

        let job: PipelineJob = match serde_json::from_str(&member) {
            Ok(job) => job,
            Err(e) => {
                component_error!(Component::Pipeline, "Dropping malformed {} entry: {}", stage, e);
                if let Err(e) = self.store.zrem(&queue_key, &member).await {
                    component_warn!(Component::Pipeline, "Failed to drop malformed {} entry: {}", stage, e);
                }
                return false;
            }
        };

        // Marked in flight before the claim so the job never reads as pending
        let processing_key = self.config.processing_key(stage);
        let marked = match self.store.sadd(&processing_key, job.id.as_str()).await {
            Ok(added) => added,
            Err(e) => {
                component_warn!(Component::Pipeline, "Failed to mark {} in flight at {}: {}", job.id, stage, e);
                false
            }
        };

        // Removal is the claim; another poller may have taken it first
        let claimed = match self.store.zrem(&queue_key, &member).await {
            Ok(claimed) => claimed,
            Err(e) => {
                component_error!(Component::Pipeline, "Failed to claim {} entry: {}", stage, e);
                false
            }
        };
        if !claimed {
            if marked {
                if let Err(e) = self.store.srem(&processing_key, job.id.as_str()).await {
                    component_warn!(Component::Pipeline, "Failed to clear in-flight marker for {}: {}", job.id, e);
                }
            }
            return false;
        }

        let result = self.execute_stage(stage, &job).await;
        let stored = self.store_result(&result).await;

        if let Err(e) = self.store.srem(&processing_key, job.id.as_str()).await {
            component_warn!(Component::Pipeline, "Failed to clear in-flight marker for {}: {}", job.id, e);
        }

        if let Err(e) = stored {
            component_error!(Component::Pipeline, "Failed to store {} result for {}: {}", stage, job.id, e);
            return true;
        }

        if !result.success {
            component_warn!(
                Component::Pipeline,
                "Job {} failed at {}: {}",
                job.id,
                stage,
                result.error.as_deref().unwrap_or("unknown error")
            );
            return true;
        }

        match stage.next() {
            Some(next) => {
                if let Err(e) = self.enqueue(&job.at_stage(next)).await {
                    component_error!(Component::Pipeline, "Failed to queue {} for {}: {}", job.id, next, e);
                } else {
                    component_debug!(Component::Pipeline, "Job {} queued for {}", job.id, next);
                }
            }
            None => component_info!(Component::Pipeline, "Job {} completed", job.id),
        }

        true
    }

    async fn load_inputs(&self, stage: Stage, job: &PipelineJob) -> PipelineResult<StageInputs> {
        let mut inputs = StageInputs::default();

        for &dependency in stage.dependencies() {
            let output = self
                .stage_result(&job.id, dependency)
                .await?
                .filter(|result| result.success)
                .and_then(|result| result.output)
                .ok_or(PipelineError::DependencyMissing {
                    stage,
                    missing: dependency,
                })?;

            match output {
                StageOutput::Select(select) => inputs.select = Some(select),
                StageOutput::Research(research) => inputs.research = Some(research),
                StageOutput::Write(draft) => inputs.draft = Some(draft),
                StageOutput::Optimize(optimized) => inputs.optimized = Some(optimized),
                StageOutput::Validate(_) => {}
            }
        }

        Ok(inputs)
    }

    async fn execute_stage(&self, stage: Stage, job: &PipelineJob) -> StageResult {
        let started = Instant::now();
        let mut result = StageResult {
            job_id: job.id.clone(),
            stage,
            success: false,
            output: None,
            error: None,
            provider: None,
            model: None,
            usage: None,
            processing_time_ms: 0,
            attempt: job.retry_count,
            completed_at: self.clock.now(),
        };

        let request = match self
            .load_inputs(stage, job)
            .await
            .and_then(|inputs| build_request(stage, job, &inputs))
        {
            Ok(request) => request,
            Err(e) => {
                result.error = Some(e.to_string());
                result.processing_time_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let completion = self.completions.complete(request).await;
        result.provider = Some(completion.provider);
        result.model = Some(completion.model.clone());
        result.usage = completion.usage;

        if completion.success {
            match StageOutput::parse(stage, &completion.content) {
                Ok(output) => {
                    result.success = true;
                    result.output = Some(output);
                }
                Err(e) => result.error = Some(e.to_string()),
            }
        } else {
            result.error = Some(
                completion
                    .error
                    .unwrap_or_else(|| "completion failed".to_string()),
            );
        }

        result.processing_time_ms = started.elapsed().as_millis() as u64;
        result.completed_at = self.clock.now();
        result
    }

    /// Completed when VALIDATE succeeded; failed when any stage result failed
    async fn terminal_outcome(&self, job_id: &JobId) -> PipelineResult<Option<JobOutcome>> {
        if let Some(validate) = self.stage_result(job_id, Stage::Validate).await? {
            if validate.success {
                let validation = match validate.output {
                    Some(StageOutput::Validate(validation)) => validation,
                    _ => ValidationOutput {
                        valid: false,
                        issues: vec!["validation output missing".to_string()],
                    },
                };
                let content = match self.stage_result(job_id, Stage::Optimize).await? {
                    Some(StageResult {
                        output: Some(StageOutput::Optimize(optimized)),
                        ..
                    }) => Some(optimized.0),
                    _ => None,
                };
                return Ok(Some(JobOutcome::Completed {
                    job_id: job_id.clone(),
                    content,
                    validation,
                }));
            }
        }

        for stage in Stage::ALL {
            if let Some(result) = self.stage_result(job_id, stage).await? {
                if !result.success {
                    return Ok(Some(JobOutcome::Failed {
                        job_id: job_id.clone(),
                        failed_stage: stage,
                        error: result.error.unwrap_or_else(|| "unknown error".to_string()),
                    }));
                }
            }
        }

        Ok(None)
    }
}
