//! Router services implementations

pub mod chat_client;
pub mod key_pool;
pub mod router;

#[cfg(test)]
pub mod tests;

pub use chat_client::*;
pub use key_pool::*;
pub use router::*;
