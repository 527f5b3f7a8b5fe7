//! Five-stage content pipeline library
//!
//! Runs a job through SELECT, RESEARCH, WRITE, OPTIMIZE and VALIDATE. Each
//! stage owns a priority queue in the shared key/value store and a background
//! poller; every stage issues exactly one completion through the router and
//! persists its result so later stages, waiters and operators can read it.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompts;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::Pipeline;
pub use types::*;
