//! Completion routing library
//!
//! This library routes chat-completion requests between a low-latency primary
//! provider and a pool of secondary-provider credentials, with a deferred
//! priority queue drained by a background batch processor.

pub mod config;
pub mod error;
pub mod services;
pub mod traits;
pub mod types;

// Re-export main types
pub use config::{KeyPoolConfig, ProviderSettings, RouterConfig};
pub use error::{RouterError, RouterResult};
pub use services::{KeyPool, OpenAiCompatibleClient, PrimaryProvider, ProviderRouter};
pub use traits::*;
pub use types::*;
