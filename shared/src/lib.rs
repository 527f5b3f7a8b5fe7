//! Shared types for the completion routing system
//!
//! Contains the request/result data model, the provider failure taxonomy,
//! the clock abstraction and the key/value store interface used by both the
//! router and the pipeline.

pub mod clock;
pub mod errors;
pub mod logging;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::*;
pub use logging::Component;
pub use store::{InMemoryStore, KeyValueStore, MockKeyValueStore};
pub use types::*;

#[cfg(feature = "redis")]
pub use store::RedisStore;
