//! Shared key-value store client
//!
//! A thin typed layer over a RESP store. The [`KvStore`] trait is what the
//! derived caches depend on; [`RedisKv`] talks to a real server and
//! [`MemoryKv`] keeps everything in-process.

mod domain;
mod memory;
mod redis_store;

pub use domain::{
    BALANCE_TTL, balance_key, cached_balance, invalidate_balance, leaderboard_key, leaderboard_top,
    store_balance,
};
pub use memory::MemoryKv;
pub use redis_store::RedisKv;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the KV layer. A missing key is never an error; reads
/// report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum KvError {
    /// Could not establish a connection
    #[error("KV connect failed: {0}")]
    Connect(String),

    /// Transport or server-side failure
    #[error("KV transport error: {0}")]
    Transport(String),

    /// The operation did not complete in time
    #[error("KV {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Key holds a value of a different type than the operation expects
    #[error("KV wrong type for key {0}")]
    WrongType(String),

    /// Stored value could not be interpreted
    #[error("KV invalid value for key {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl From<::redis::RedisError> for KvError {
    fn from(error: ::redis::RedisError) -> Self {
        if error.kind() == ::redis::ErrorKind::TypeError {
            Self::InvalidValue {
                key: String::new(),
                reason: error.to_string(),
            }
        } else {
            Self::Transport(error.to_string())
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// A single write command batched by [`KvStore::pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum KvCommand {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    IncrBy {
        key: String,
        by: i64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    ZIncrBy {
        key: String,
        increment: f64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
}

/// Typed operations against the shared store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Connectivity probe
    async fn ping(&self) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Set a string value; `None` means no expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    async fn del(&self, key: &str) -> KvResult<()>;

    async fn incr(&self, key: &str) -> KvResult<i64>;

    async fn decr(&self, key: &str) -> KvResult<i64>;

    /// Returns false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()>;

    async fn zincrby(&self, key: &str, increment: f64, member: &str) -> KvResult<f64>;

    /// Members ordered by descending score with their scores, inclusive
    /// indices, negative indices counting from the end
    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> KvResult<Vec<(String, f64)>>;

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>>;

    async fn zrem(&self, key: &str, members: &[&str]) -> KvResult<()>;

    /// Members with `min <= score <= max`; bounds accept `-inf`, `+inf` and a
    /// leading `(` for exclusive ranges
    async fn zrangebyscore(&self, key: &str, min: &str, max: &str) -> KvResult<Vec<String>>;

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<()>;

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;

    async fn mget(&self, keys: &[&str]) -> KvResult<Vec<Option<String>>>;

    async fn mset(&self, pairs: &[(&str, &str)]) -> KvResult<()>;

    /// Send every command in one round trip
    async fn pipeline(&self, commands: Vec<KvCommand>) -> KvResult<()>;
}

/// Transport used to reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

/// Connection settings for the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// `host:port`, or a socket path starting with `/`
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
    /// Explicit transport; a socket path always selects unix
    pub network: Option<Network>,
    pub pool_size: usize,
    pub min_idle: usize,
    pub dial_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            network: None,
            pool_size: 100,
            min_idle: 20,
            dial_timeout_secs: 5,
            io_timeout_secs: 3,
            max_retries: 3,
        }
    }
}

impl KvConfig {
    /// Effective transport for the configured address
    #[must_use]
    pub fn network(&self) -> Network {
        if self.addr.starts_with('/') {
            Network::Unix
        } else {
            self.network.unwrap_or(Network::Tcp)
        }
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}
