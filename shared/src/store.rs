//! Key/value store interface shared by the router and the pipeline
//!
//! The store offers three families of atomic single-key operations:
//! - sorted sets (`zadd` / `zrange` / `zrem` / `zcard`) used as priority queues
//! - plain sets (`sadd` / `srem` / `scard`) used as in-flight registries
//! - strings with expiry (`get` / `set_ex` / `del`) used for results
//!
//! No multi-key transactions are offered; callers resolve races by idempotent
//! overwrite and by checking the return value of `zrem`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::StoreResult;

/// External ordered key/value store
#[mockall::automock]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Add or re-score a member of a sorted set
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()>;

    /// Members ranked `start..=stop` by ascending score (ties broken by member)
    async fn zrange(&self, key: &str, start: usize, stop: usize) -> StoreResult<Vec<String>>;

    /// Remove a member; returns whether it was present
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Add a member to a set; returns whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn scard(&self, key: &str) -> StoreResult<usize>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key of any type
    async fn del(&self, key: &str) -> StoreResult<()>;
}

#[derive(Default)]
struct StoreData {
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    strings: HashMap<String, (String, Instant)>,
}

/// Process-local store; expiry is applied lazily on read
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<StoreData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange(&self, key: &str, start: usize, stop: usize) -> StoreResult<Vec<String>> {
        let data = self.data.lock().await;
        let Some(set) = data.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        if stop < start {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<(&String, f64)> = set.iter().map(|(member, score)| (member, *score)).collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        Ok(ranked
            .into_iter()
            .skip(start)
            .take((stop - start).saturating_add(1))
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut data = self.data.lock().await;
        let removed = match data.sorted_sets.get_mut(key) {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        if data.sorted_sets.get(key).is_some_and(|set| set.is_empty()) {
            data.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let data = self.data.lock().await;
        Ok(data.sorted_sets.get(key).map_or(0, |set| set.len()))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut data = self.data.lock().await;
        Ok(data.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut data = self.data.lock().await;
        let removed = data.sets.get_mut(key).is_some_and(|set| set.remove(member));
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let data = self.data.lock().await;
        Ok(data.sets.get(key).is_some_and(|set| set.contains(member)))
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        let data = self.data.lock().await;
        Ok(data.sets.get(key).map_or(0, |set| set.len()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.data.lock().await;
        match data.strings.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                data.strings.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.strings
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.strings.remove(key);
        data.sets.remove(key);
        data.sorted_sets.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::KeyValueStore;
    use crate::errors::{StoreError, StoreResult};

    /// Redis-backed store using a multiplexed async connection per command
    pub struct RedisStore {
        client: redis::Client,
    }

    impl RedisStore {
        /// Open a client and verify the server answers `PING`
        pub async fn connect(redis_url: &str) -> StoreResult<Self> {
            let client = redis::Client::open(redis_url).map_err(|e| StoreError::Connection {
                message: format!("invalid redis url: {e}"),
            })?;

            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::Connection { message: e.to_string() })?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("PING", e.to_string()))?;

            Ok(Self { client })
        }

        async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::Connection { message: e.to_string() })
        }
    }

    #[async_trait]
    impl KeyValueStore for RedisStore {
        async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
            let mut conn = self.connection().await?;
            let _: i64 = redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("ZADD", e.to_string()))?;
            Ok(())
        }

        async fn zrange(&self, key: &str, start: usize, stop: usize) -> StoreResult<Vec<String>> {
            let mut conn = self.connection().await?;
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("ZRANGE", e.to_string()))
        }

        async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
            let mut conn = self.connection().await?;
            let removed: i64 = redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("ZREM", e.to_string()))?;
            Ok(removed > 0)
        }

        async fn zcard(&self, key: &str) -> StoreResult<usize> {
            let mut conn = self.connection().await?;
            redis::cmd("ZCARD")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("ZCARD", e.to_string()))
        }

        async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
            let mut conn = self.connection().await?;
            let added: i64 = redis::cmd("SADD")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("SADD", e.to_string()))?;
            Ok(added > 0)
        }

        async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
            let mut conn = self.connection().await?;
            let removed: i64 = redis::cmd("SREM")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("SREM", e.to_string()))?;
            Ok(removed > 0)
        }

        async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
            let mut conn = self.connection().await?;
            redis::cmd("SISMEMBER")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("SISMEMBER", e.to_string()))
        }

        async fn scard(&self, key: &str) -> StoreResult<usize> {
            let mut conn = self.connection().await?;
            redis::cmd("SCARD")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("SCARD", e.to_string()))
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            let mut conn = self.connection().await?;
            redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("GET", e.to_string()))
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .arg(value)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("SETEX", e.to_string()))?;
            Ok(())
        }

        async fn del(&self, key: &str) -> StoreResult<()> {
            let mut conn = self.connection().await?;
            let _: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::command("DEL", e.to_string()))?;
            Ok(())
        }
    }
}
