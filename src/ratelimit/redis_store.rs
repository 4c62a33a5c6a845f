//! Redis-backed counter store.
//!
//! Lets several API replicas share one set of counters. Increments run as a
//! single Lua script so `INCR` and the expiry are applied in one atomic step;
//! the store never does a get-then-set round trip.
//!
//! Counting across replicas is best effort. A Redis outage surfaces as a
//! [`StoreError`], which the limiter resolves through its fail mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::counter::{deadline, CounterEntry};
use super::store::{CounterStore, StoreError, StoreResult};

/// Increment a key, arming its expiry only when the window starts.
///
/// Returns `{count, pttl_ms}`. A key left without an expiry (for example by
/// a manual `SET`) is re-armed so it cannot live forever.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Key prefix for Redis keys (default: "forge-throttle:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "forge-throttle:".to_string(),
        }
    }
}

/// Counter store shared through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    script: Arc<Script>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// A store over the same connection whose keys live under an extra prefix.
    ///
    /// Tiers use this to keep independent counters on one Redis.
    pub fn namespaced(&self, namespace: &str) -> Self {
        let mut store = self.clone();
        store.config.key_prefix = format!("{}{}:", self.config.key_prefix, namespace);
        store
    }

    /// Get the configured key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn window_end(&self, pttl_ms: i64) -> DateTime<Utc> {
        let ttl = Duration::from_millis(pttl_ms.max(0) as u64);
        deadline(self.clock.now(), ttl)
    }
}

/// Interpret a `GET`/`PTTL` pair. A key without an expiry (`PTTL` -1) was
/// not written by this store and is treated as absent, like a missing one (-2).
fn live_entry(count: Option<u64>, pttl_ms: i64, now: DateTime<Utc>) -> Option<CounterEntry> {
    if pttl_ms < 0 {
        return None;
    }
    count.map(|count| CounterEntry {
        count,
        window_end: deadline(now, Duration::from_millis(pttl_ms as u64)),
    })
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Unavailable(format!("timed out: {}", e))
        } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CounterEntry>> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let (count, pttl): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await?;

        Ok(live_entry(count, pttl, self.clock.now()))
    }

    async fn set(&self, key: &str, count: u64, ttl: Duration) -> StoreResult<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        conn.pset_ex::<_, _, ()>(&key, count, ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<CounterEntry> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let (count, pttl): (u64, i64) = self
            .script
            .key(&key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(CounterEntry {
            count,
            window_end: self.window_end(pttl),
        })
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }
}
