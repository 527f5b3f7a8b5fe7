//! Pipeline data types: stages, jobs, typed stage outputs and outcomes

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{Priority, ProviderId, SharedError, TokenUsage};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

/// The five pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Select,
    Research,
    Write,
    Optimize,
    Validate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Select,
        Stage::Research,
        Stage::Write,
        Stage::Optimize,
        Stage::Validate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Select => "SELECT",
            Stage::Research => "RESEARCH",
            Stage::Write => "WRITE",
            Stage::Optimize => "OPTIMIZE",
            Stage::Validate => "VALIDATE",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_final(self) -> bool {
        self == Stage::Validate
    }

    /// Stages that run before this one
    pub fn upstream(self) -> &'static [Stage] {
        static ORDER: [Stage; 5] = Stage::ALL;
        &ORDER[..self.index()]
    }

    /// Stages whose outputs this stage's prompt reads
    pub fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::Select => &[],
            Stage::Research => &[Stage::Select],
            Stage::Write => &[Stage::Select, Stage::Research],
            Stage::Optimize => &[Stage::Write],
            Stage::Validate => &[Stage::Optimize],
        }
    }

    pub fn temperature(self) -> f32 {
        match self {
            Stage::Select => 0.6,
            Stage::Research => 0.5,
            Stage::Write => 0.7,
            Stage::Optimize => 0.4,
            Stage::Validate => 0.3,
        }
    }

    pub fn max_tokens(self) -> u32 {
        match self {
            Stage::Select => 500,
            Stage::Research => 800,
            Stage::Write => 4000,
            Stage::Optimize => 2000,
            Stage::Validate => 500,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown stage: {s}"))
    }
}

/// Unique identifier for a pipeline job
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(format!("job_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(s: &str) -> Result<Self, SharedError> {
        match s.strip_prefix("job_") {
            Some(rest) if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Ok(Self(s.to_string()))
            }
            _ => Err(SharedError::InvalidId { input: s.to_string() }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to write about and for whom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentConfig {
    pub pillar: String,
    pub theme: Option<String>,
    pub angle: Option<String>,
    pub target_audience: String,
    pub engagement_goal: String,
    pub content_format: String,
    pub emotional_trigger: Option<String>,
    pub word_count_target: u32,
    pub language: String,
    pub bilingual: bool,
}

impl ContentConfig {
    pub fn new(pillar: impl Into<String>, target_audience: impl Into<String>) -> Self {
        Self {
            pillar: pillar.into(),
            theme: None,
            angle: None,
            target_audience: target_audience.into(),
            engagement_goal: "engagement".to_string(),
            content_format: "post".to_string(),
            emotional_trigger: None,
            word_count_target: 300,
            language: "en".to_string(),
            bilingual: false,
        }
    }
}

/// Writing voice; levels are on a 0-10 scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub humor_level: u8,
    pub formality: u8,
    pub enthusiasm: u8,
    pub use_emoji: bool,
    pub sentence_style: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            trait_name: "friendly".to_string(),
            humor_level: 5,
            formality: 5,
            enthusiasm: 5,
            use_emoji: false,
            sentence_style: "varied".to_string(),
        }
    }
}

/// Per-job configuration carried unchanged through every stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub content: ContentConfig,
    pub voice: VoiceConfig,
    pub brand_context: String,
}

impl JobConfig {
    pub fn new(content: ContentConfig) -> Self {
        Self {
            content,
            voice: VoiceConfig::default(),
            brand_context: String::new(),
        }
    }
}

/// A job as it travels through the stage queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: JobId,
    /// Stage this copy of the job is queued for
    pub stage: Stage,
    pub config: JobConfig,
    pub used_content_hashes: Vec<String>,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl PipelineJob {
    /// Same job, queued for another stage
    pub fn at_stage(&self, stage: Stage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOutput {
    pub theme_id: String,
    pub theme_title: String,
    pub angle: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResearchOutput(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftOutput(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptimizedOutput(pub Value);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Structured output of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutput {
    Select(SelectOutput),
    Research(ResearchOutput),
    Write(DraftOutput),
    Optimize(OptimizedOutput),
    Validate(ValidationOutput),
}

impl StageOutput {
    /// Parse a provider reply as the given stage's JSON output
    pub fn parse(stage: Stage, content: &str) -> PipelineResult<Self> {
        let invalid = |reason: String| PipelineError::InvalidOutput { stage, reason };
        let value: Value = serde_json::from_str(content.trim()).map_err(|e| invalid(e.to_string()))?;
        if !value.is_object() {
            return Err(invalid("expected a JSON object".to_string()));
        }

        Ok(match stage {
            Stage::Select => StageOutput::Select(serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?),
            Stage::Research => StageOutput::Research(ResearchOutput(value)),
            Stage::Write => StageOutput::Write(DraftOutput(value)),
            Stage::Optimize => StageOutput::Optimize(OptimizedOutput(value)),
            Stage::Validate => {
                StageOutput::Validate(serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?)
            }
        })
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Select(_) => Stage::Select,
            StageOutput::Research(_) => Stage::Research,
            StageOutput::Write(_) => Stage::Write,
            StageOutput::Optimize(_) => Stage::Optimize,
            StageOutput::Validate(_) => Stage::Validate,
        }
    }
}

/// Persisted outcome of one stage of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub job_id: JobId,
    pub stage: Stage,
    pub success: bool,
    pub output: Option<StageOutput>,
    pub error: Option<String>,
    /// Absent when the stage failed before reaching a provider
    pub provider: Option<ProviderId>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub processing_time_ms: u64,
    /// Job retry count at the time this result was produced
    pub attempt: u32,
    pub completed_at: DateTime<Utc>,
}

/// Where a job is with respect to one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Queued,
    Processing,
    Succeeded,
    Failed,
}

/// Terminal view of a job returned to waiters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        job_id: JobId,
        /// OPTIMIZE output; `None` if it expired before VALIDATE was read
        content: Option<Value>,
        validation: ValidationOutput,
    },
    Failed {
        job_id: JobId,
        failed_stage: Stage,
        error: String,
    },
    TimedOut {
        job_id: JobId,
    },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDepth {
    pub stage: Stage,
    pub queued: usize,
    pub processing: usize,
}

/// Queue depth across all stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub stages: Vec<StageDepth>,
    pub total: usize,
}

impl PipelineStats {
    pub fn queued(&self, stage: Stage) -> usize {
        self.stages
            .iter()
            .find(|depth| depth.stage == stage)
            .map_or(0, |depth| depth.queued)
    }
}
