//! In-process [`KvStore`] used in tests and single-node deployments

use super::{KvCommand, KvError, KvResult, KvStore};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// One end of a score range as accepted by `ZRANGEBYSCORE`
#[derive(Debug, Clone, Copy)]
struct Bound {
    value: f64,
    exclusive: bool,
}

impl Bound {
    fn parse(key: &str, raw: &str) -> KvResult<Self> {
        let (exclusive, body) = match raw.strip_prefix('(') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let value = match body {
            "-inf" => f64::NEG_INFINITY,
            "+inf" | "inf" => f64::INFINITY,
            other => other.parse().map_err(|_| KvError::InvalidValue {
                key: key.to_string(),
                reason: format!("bad score bound {raw}"),
            })?,
        };
        Ok(Self { value, exclusive })
    }

    fn below(self, score: f64) -> bool {
        if self.exclusive {
            self.value < score
        } else {
            self.value <= score
        }
    }

    fn above(self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

/// Resolve redis-style inclusive indices against a length
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// Map-backed store with the same semantics as the Redis client: lazy
/// expiry, typed values and wrong-type errors.
#[derive(Debug, Default)]
pub struct MemoryKv {
    slots: DashMap<String, Slot>,
    offline: AtomicBool,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> KvResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KvError::Transport("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Live slot for `key`, dropping it if expired
    fn live(&self, key: &str) -> Option<Slot> {
        let now = Instant::now();
        let slot = self.slots.get(key).map(|s| s.clone())?;
        if slot.is_live(now) {
            Some(slot)
        } else {
            self.slots.remove_if(key, |_, s| !s.is_live(now));
            None
        }
    }

    /// Run `f` against the live value of `key`, creating it with `init` when
    /// absent or expired
    fn with_slot<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Slot) -> KvResult<T>,
    ) -> KvResult<T> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.insert(Slot::new(init()));
                }
                f(occupied.get_mut())
            }
            MapEntry::Vacant(vacant) => {
                let mut slot = Slot::new(init());
                let result = f(&mut slot);
                if result.is_ok() {
                    vacant.insert(slot);
                }
                result
            }
        }
    }

    fn set_now(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn incr_by(&self, key: &str, by: i64) -> KvResult<i64> {
        self.with_slot(
            key,
            || Value::Str("0".to_string()),
            |slot| match &mut slot.value {
                Value::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| KvError::InvalidValue {
                        key: key.to_string(),
                        reason: "value is not an integer".to_string(),
                    })?;
                    let next = current.checked_add(by).ok_or_else(|| KvError::InvalidValue {
                        key: key.to_string(),
                        reason: "increment would overflow".to_string(),
                    })?;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(KvError::WrongType(key.to_string())),
            },
        )
    }

    fn expire_now(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }

    fn zincr(&self, key: &str, increment: f64, member: &str) -> KvResult<f64> {
        self.with_slot(
            key,
            || Value::ZSet(HashMap::new()),
            |slot| match &mut slot.value {
                Value::ZSet(set) => {
                    let score = set.entry(member.to_string()).or_insert(0.0);
                    *score += increment;
                    Ok(*score)
                }
                _ => Err(KvError::WrongType(key.to_string())),
            },
        )
    }

    fn zset_snapshot(&self, key: &str) -> KvResult<Option<HashMap<String, f64>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::ZSet(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn zrem_now(&self, key: &str, members: &[&str]) -> KvResult<()> {
        let now = Instant::now();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(());
        };
        if !slot.is_live(now) {
            return Ok(());
        }
        match &mut slot.value {
            Value::ZSet(set) => {
                for member in members {
                    set.remove(*member);
                }
                Ok(())
            }
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn hset_now(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<()> {
        self.with_slot(
            key,
            || Value::Hash(HashMap::new()),
            |slot| match &mut slot.value {
                Value::Hash(hash) => {
                    for (field, value) in fields {
                        hash.insert((*field).to_string(), (*value).to_string());
                    }
                    Ok(())
                }
                _ => Err(KvError::WrongType(key.to_string())),
            },
        )
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> KvResult<()> {
        self.check_online()
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check_online()?;
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.check_online()?;
        self.set_now(key, value, ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.check_online()?;
        self.slots.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        self.check_online()?;
        self.incr_by(key, 1)
    }

    async fn decr(&self, key: &str) -> KvResult<i64> {
        self.check_online()?;
        self.incr_by(key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.check_online()?;
        Ok(self.expire_now(key, ttl))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        self.check_online()?;
        self.with_slot(
            key,
            || Value::ZSet(HashMap::new()),
            |slot| match &mut slot.value {
                Value::ZSet(set) => {
                    set.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(KvError::WrongType(key.to_string())),
            },
        )
    }

    async fn zincrby(&self, key: &str, increment: f64, member: &str) -> KvResult<f64> {
        self.check_online()?;
        self.zincr(key, increment, member)
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> KvResult<Vec<(String, f64)>> {
        self.check_online()?;
        let Some(set) = self.zset_snapshot(key)? else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(String, f64)> = set.into_iter().collect();
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        Ok(match resolve_range(members.len(), start, stop) {
            Some((from, to)) => members.drain(from..=to).collect(),
            None => Vec::new(),
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.check_online()?;
        Ok(self
            .zset_snapshot(key)?
            .and_then(|set| set.get(member).copied()))
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> KvResult<()> {
        self.check_online()?;
        self.zrem_now(key, members)
    }

    async fn zrangebyscore(&self, key: &str, min: &str, max: &str) -> KvResult<Vec<String>> {
        self.check_online()?;
        let low = Bound::parse(key, min)?;
        let high = Bound::parse(key, max)?;
        let Some(set) = self.zset_snapshot(key)? else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(String, f64)> = set
            .into_iter()
            .filter(|(_, score)| low.below(*score) && high.above(*score))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members.into_iter().map(|(member, _)| member).collect())
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<()> {
        self.check_online()?;
        self.hset_now(key, fields)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.check_online()?;
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.check_online()?;
        match self.live(key) {
            None => Ok(HashMap::new()),
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn mget(&self, keys: &[&str]) -> KvResult<Vec<Option<String>>> {
        self.check_online()?;
        // MGET reports non-string values as missing
        Ok(keys
            .iter()
            .map(|key| match self.live(key) {
                Some(Slot {
                    value: Value::Str(s),
                    ..
                }) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn mset(&self, pairs: &[(&str, &str)]) -> KvResult<()> {
        self.check_online()?;
        for (key, value) in pairs {
            self.set_now(key, value, None);
        }
        Ok(())
    }

    async fn pipeline(&self, commands: Vec<KvCommand>) -> KvResult<()> {
        self.check_online()?;
        for command in commands {
            match command {
                KvCommand::Set { key, value, ttl } => self.set_now(&key, &value, ttl),
                KvCommand::Del { key } => {
                    self.slots.remove(&key);
                }
                KvCommand::IncrBy { key, by } => {
                    self.incr_by(&key, by)?;
                }
                KvCommand::Expire { key, ttl } => {
                    self.expire_now(&key, ttl);
                }
                KvCommand::ZAdd { key, score, member } => {
                    self.with_slot(
                        &key,
                        || Value::ZSet(HashMap::new()),
                        |slot| match &mut slot.value {
                            Value::ZSet(set) => {
                                set.insert(member.clone(), score);
                                Ok(())
                            }
                            _ => Err(KvError::WrongType(key.clone())),
                        },
                    )?;
                }
                KvCommand::ZIncrBy {
                    key,
                    increment,
                    member,
                } => {
                    self.zincr(&key, increment, &member)?;
                }
                KvCommand::ZRem { key, member } => self.zrem_now(&key, &[member.as_str()])?,
                KvCommand::HSet { key, field, value } => {
                    self.hset_now(&key, &[(field.as_str(), value.as_str())])?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("nope").await.unwrap(), None);
        assert_eq!(kv.hget("nope", "f").await.unwrap(), None);
        assert!(kv.hgetall("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let kv = MemoryKv::new();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = MemoryKv::new();
        kv.set("short", "1", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(kv.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get("short").await.unwrap(), None);
        assert!(!kv.expire("short", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_decr() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
        assert_eq!(kv.decr("counter").await.unwrap(), 1);

        kv.set("text", "abc", None).await.unwrap();
        assert!(matches!(
            kv.incr("text").await,
            Err(KvError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let kv = MemoryKv::new();
        kv.zadd("board", 1.0, "a").await.unwrap();
        assert!(matches!(kv.get("board").await, Err(KvError::WrongType(_))));
        assert!(matches!(
            kv.hset("board", &[("f", "v")]).await,
            Err(KvError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_sorted_set_ordering() {
        let kv = MemoryKv::new();
        kv.zadd("board", 10.0, "alice").await.unwrap();
        kv.zadd("board", 30.0, "bob").await.unwrap();
        kv.zadd("board", 20.0, "carol").await.unwrap();
        assert_eq!(kv.zincrby("board", 15.0, "alice").await.unwrap(), 25.0);

        let top = kv.zrevrange_with_scores("board", 0, 1).await.unwrap();
        assert_eq!(
            top,
            vec![("bob".to_string(), 30.0), ("alice".to_string(), 25.0)]
        );

        let all = kv.zrevrange_with_scores("board", 0, -1).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(kv.zrevrange_with_scores("board", 5, 10).await.unwrap().is_empty());

        assert_eq!(kv.zscore("board", "carol").await.unwrap(), Some(20.0));
        kv.zrem("board", &["carol"]).await.unwrap();
        assert_eq!(kv.zscore("board", "carol").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zrangebyscore_bounds() {
        let kv = MemoryKv::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            kv.zadd("z", score, member).await.unwrap();
        }
        assert_eq!(
            kv.zrangebyscore("z", "-inf", "+inf").await.unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(kv.zrangebyscore("z", "(1", "3").await.unwrap(), vec!["b", "c"]);
        assert_eq!(kv.zrangebyscore("z", "1", "(3").await.unwrap(), vec!["a", "b"]);
        assert!(kv.zrangebyscore("z", "x", "3").await.is_err());
    }

    #[tokio::test]
    async fn test_mget_mset() {
        let kv = MemoryKv::new();
        kv.mset(&[("a", "1"), ("b", "2")]).await.unwrap();
        kv.hset("h", &[("f", "v")]).await.unwrap();
        let values = kv.mget(&["a", "missing", "b", "h"]).await.unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("2".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_pipeline() {
        let kv = MemoryKv::new();
        kv.pipeline(vec![
            KvCommand::Set {
                key: "a".to_string(),
                value: "5".to_string(),
                ttl: None,
            },
            KvCommand::IncrBy {
                key: "a".to_string(),
                by: 3,
            },
            KvCommand::HSet {
                key: "h".to_string(),
                field: "name".to_string(),
                value: "guild".to_string(),
            },
            KvCommand::ZIncrBy {
                key: "z".to_string(),
                increment: 2.5,
                member: "m".to_string(),
            },
        ])
        .await
        .unwrap();

        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("8"));
        assert_eq!(kv.hget("h", "name").await.unwrap().as_deref(), Some("guild"));
        assert_eq!(kv.zscore("z", "m").await.unwrap(), Some(2.5));
    }

    #[tokio::test]
    async fn test_offline_injection() {
        let kv = MemoryKv::new();
        kv.set("k", "v", None).await.unwrap();
        kv.set_offline(true);
        assert!(matches!(kv.get("k").await, Err(KvError::Transport(_))));
        assert!(kv.ping().await.is_err());

        kv.set_offline(false);
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
