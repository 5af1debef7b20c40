//! Redis-backed [`KvStore`]

use super::{KvCommand, KvConfig, KvError, KvResult, KvStore, Network};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, Pipeline, RedisConnectionInfo};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 6379;

/// Multiplexed connections to a Redis-compatible store.
///
/// Each [`ConnectionManager`] pipelines concurrent requests over one socket
/// and reconnects on its own; `min_idle` of them are dialed up front and
/// handed out round-robin.
pub struct RedisKv {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
    io_timeout: Duration,
    max_retries: u32,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv")
            .field("connections", &self.connections.len())
            .field("io_timeout", &self.io_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Build the connection info for the configured address
fn connection_info(config: &KvConfig) -> ConnectionInfo {
    let addr = match config.network() {
        Network::Unix => ConnectionAddr::Unix(PathBuf::from(&config.addr)),
        Network::Tcp => {
            let (host, port) = match config.addr.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEFAULT_PORT)),
                None => (config.addr.clone(), DEFAULT_PORT),
            };
            ConnectionAddr::Tcp(host, port)
        }
    };

    ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db: config.db,
            password: config.password.clone(),
            ..Default::default()
        },
    }
}

fn is_retryable(error: &redis::RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_timeout()
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisKv {
    /// Dial the store and probe it. Startup must not proceed on error.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Connect` if the client cannot be built or a
    /// connection cannot be dialed within the dial timeout, and the ping
    /// error if the probe fails.
    pub async fn connect(config: &KvConfig) -> KvResult<Self> {
        let client = redis::Client::open(connection_info(config))
            .map_err(|e| KvError::Connect(e.to_string()))?;

        let count = config.min_idle.clamp(1, config.pool_size.max(1));
        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            let manager = timeout(config.dial_timeout(), ConnectionManager::new(client.clone()))
                .await
                .map_err(|_| KvError::Timeout {
                    op: "dial",
                    after: config.dial_timeout(),
                })?
                .map_err(|e| KvError::Connect(e.to_string()))?;
            connections.push(manager);
        }

        let kv = Self {
            connections,
            next: AtomicUsize::new(0),
            io_timeout: config.io_timeout(),
            max_retries: config.max_retries,
        };
        kv.ping().await?;

        match config.network() {
            Network::Unix => info!(addr = %config.addr, connections = count, "KV connected via unix socket"),
            Network::Tcp => info!(addr = %config.addr, connections = count, "KV connected via TCP"),
        }
        Ok(kv)
    }

    fn connection(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[idx].clone()
    }

    /// Run one command with the read/write deadline, retrying transport
    /// failures up to `max_retries` times
    async fn run<T: FromRedisValue + Send>(&self, op: &'static str, cmd: &Cmd) -> KvResult<T> {
        let mut attempt = 0;
        loop {
            let mut conn = self.connection();
            match timeout(self.io_timeout, cmd.query_async::<_, T>(&mut conn)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempt < self.max_retries && is_retryable(&e) => {
                    debug!(op, attempt, error = %e, "Retrying KV command");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if attempt < self.max_retries => {
                    debug!(op, attempt, "Retrying KV command after timeout");
                }
                Err(_) => {
                    return Err(KvError::Timeout {
                        op,
                        after: self.io_timeout,
                    });
                }
            }
            attempt += 1;
        }
    }

    async fn run_pipeline(&self, pipe: &Pipeline) -> KvResult<()> {
        let mut conn = self.connection();
        timeout(self.io_timeout, pipe.query_async::<_, ()>(&mut conn))
            .await
            .map_err(|_| KvError::Timeout {
                op: "pipeline",
                after: self.io_timeout,
            })?
            .map_err(KvError::from)
    }
}

fn set_cmd(key: &str, value: &str, ttl: Option<Duration>) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(ttl_millis(ttl));
    }
    cmd
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> KvResult<()> {
        let pong: String = self.run("ping", &redis::cmd("PING")).await?;
        if pong != "PONG" {
            warn!(reply = %pong, "Unexpected ping reply");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.run("get", redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.run("set", &set_cmd(key, value, ttl)).await
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.run("del", redis::cmd("DEL").arg(key)).await
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        self.run("incr", redis::cmd("INCR").arg(key)).await
    }

    async fn decr(&self, key: &str) -> KvResult<i64> {
        self.run("decr", redis::cmd("DECR").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.run("expire", redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)))
            .await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        self.run("zadd", redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await
    }

    async fn zincrby(&self, key: &str, increment: f64, member: &str) -> KvResult<f64> {
        self.run(
            "zincrby",
            redis::cmd("ZINCRBY").arg(key).arg(increment).arg(member),
        )
        .await
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> KvResult<Vec<(String, f64)>> {
        self.run(
            "zrevrange",
            redis::cmd("ZREVRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.run("zscore", redis::cmd("ZSCORE").arg(key).arg(member))
            .await
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> KvResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.run("zrem", redis::cmd("ZREM").arg(key).arg(members))
            .await
    }

    async fn zrangebyscore(&self, key: &str, min: &str, max: &str) -> KvResult<Vec<String>> {
        self.run(
            "zrangebyscore",
            redis::cmd("ZRANGEBYSCORE").arg(key).arg(min).arg(max),
        )
        .await
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        self.run("hset", &cmd).await
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.run("hget", redis::cmd("HGET").arg(key).arg(field))
            .await
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.run("hgetall", redis::cmd("HGETALL").arg(key)).await
    }

    async fn mget(&self, keys: &[&str]) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run("mget", redis::cmd("MGET").arg(keys)).await
    }

    async fn mset(&self, pairs: &[(&str, &str)]) -> KvResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("MSET");
        for (key, value) in pairs {
            cmd.arg(*key).arg(*value);
        }
        self.run("mset", &cmd).await
    }

    async fn pipeline(&self, commands: Vec<KvCommand>) -> KvResult<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for command in &commands {
            match command {
                KvCommand::Set { key, value, ttl } => {
                    pipe.add_command(set_cmd(key, value, *ttl)).ignore();
                }
                KvCommand::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                KvCommand::IncrBy { key, by } => {
                    pipe.cmd("INCRBY").arg(key).arg(*by).ignore();
                }
                KvCommand::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl)).ignore();
                }
                KvCommand::ZAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                KvCommand::ZIncrBy {
                    key,
                    increment,
                    member,
                } => {
                    pipe.cmd("ZINCRBY").arg(key).arg(*increment).arg(member).ignore();
                }
                KvCommand::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                KvCommand::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
            }
        }
        self.run_pipeline(&pipe).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_tcp() {
        let config = KvConfig {
            addr: "cache.internal:6380".to_string(),
            password: Some("secret".to_string()),
            db: 3,
            ..Default::default()
        };
        let info = connection_info(&config);
        assert_eq!(
            info.addr,
            ConnectionAddr::Tcp("cache.internal".to_string(), 6380)
        );
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_connection_info_default_port() {
        let config = KvConfig {
            addr: "localhost".to_string(),
            ..Default::default()
        };
        let info = connection_info(&config);
        assert_eq!(info.addr, ConnectionAddr::Tcp("localhost".to_string(), 6379));
    }

    #[test]
    fn test_connection_info_unix() {
        let config = KvConfig {
            addr: "/run/redis.sock".to_string(),
            ..Default::default()
        };
        let info = connection_info(&config);
        assert_eq!(
            info.addr,
            ConnectionAddr::Unix(PathBuf::from("/run/redis.sock"))
        );
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(120)), 120_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
