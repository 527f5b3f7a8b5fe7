//! Pipeline configuration and store key layout

use std::time::Duration;

use crate::types::{JobId, Stage};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tick period of each stage poller
    pub stage_poll_interval: Duration,
    /// Entries claimed per stage per tick
    pub stage_batch_size: usize,
    /// Lifetime of stage results and job records
    pub result_ttl: Duration,
    pub wait_poll_interval: Duration,
    pub default_wait_timeout: Duration,
    pub priority_weight_ms: u64,
    /// Caller-driven resubmissions allowed per job
    pub max_retries: u32,
    pub key_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_poll_interval: Duration::from_millis(100),
            stage_batch_size: 5,
            result_ttl: Duration::from_secs(3600),
            wait_poll_interval: Duration::from_millis(500),
            default_wait_timeout: Duration::from_secs(120),
            priority_weight_ms: 1000,
            max_retries: 3,
            key_prefix: "pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn queue_key(&self, stage: Stage) -> String {
        format!("{}:queue:{}", self.key_prefix, stage)
    }

    pub fn processing_key(&self, stage: Stage) -> String {
        format!("{}:processing:{}", self.key_prefix, stage)
    }

    pub fn result_key(&self, job_id: &JobId, stage: Stage) -> String {
        format!("{}:result:{}:{}", self.key_prefix, job_id, stage)
    }

    pub fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.key_prefix, job_id)
    }
}
