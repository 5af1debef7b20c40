//! Two-tier object cache
//!
//! L1 is an in-process moka cache bounded by total entry cost with TinyLFU
//! admission. L2 is the shared KV store holding JSON encoded values. Cold
//! misses are loaded once per key through [`Flight`].

mod flight;
mod metrics;

pub use flight::{Flight, Leader, Role, Waiter};
pub use metrics::CacheMetrics;

use crate::CACHE_TARGET;
use crate::kv::{KvError, KvStore};
use metrics::Counters;
use moka::Expiry;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cache backend error: {0}")]
    Backend(#[from] KvError),
}

/// Sizing and expiry of an [`ObjectCache`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed cost of L1 entries
    pub l1_max_cost: u64,
    /// Expected number of distinct keys tracked for admission
    pub l1_num_counters: u64,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_cost: 10 * 1024 * 1024,
            l1_num_counters: 100_000,
            default_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Clone)]
struct L1Entry<V> {
    value: V,
    cost: u32,
    ttl: Duration,
}

struct PerEntryTtl;

impl<V> Expiry<String, L1Entry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &L1Entry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &L1Entry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Hot/cold cache for one value type.
///
/// Cheap to clone; clones share both tiers, the flight map and metrics.
#[derive(Clone)]
pub struct ObjectCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    l1: Cache<String, L1Entry<V>>,
    l2: Option<Arc<dyn KvStore>>,
    flight: Flight,
    counters: Arc<Counters>,
    default_ttl: Duration,
}

impl<V> ObjectCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Build a cache. With `l2 == None` only the in-process tier is used.
    #[must_use]
    pub fn new(config: &CacheConfig, l2: Option<Arc<dyn KvStore>>) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = Arc::clone(&counters);

        let l1 = Cache::builder()
            .max_capacity(config.l1_max_cost)
            .initial_capacity(usize::try_from(config.l1_num_counters / 10).unwrap_or(usize::MAX))
            .weigher(|_key: &String, entry: &L1Entry<V>| entry.cost)
            .expire_after(PerEntryTtl)
            .eviction_listener(move |_key, entry: L1Entry<V>, cause: RemovalCause| {
                if cause.was_evicted() {
                    listener_counters.record_eviction(entry.cost);
                }
            })
            .build();

        Self {
            l1,
            l2,
            flight: Flight::default(),
            counters,
            default_ttl: config.default_ttl(),
        }
    }

    fn insert_local(&self, key: &str, value: V, cost: u32, ttl: Duration) {
        let cost = cost.max(1);
        self.l1.insert(key.to_string(), L1Entry { value, cost, ttl });
        self.counters.record_add(cost);
    }

    async fn read_remote(&self, key: &str) -> Option<V> {
        let l2 = self.l2.as_ref()?;
        match l2.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(target: CACHE_TARGET, %key, error = %e, "Undecodable L2 entry treated as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(target: CACHE_TARGET, %key, error = %e, "L2 read failed, treated as miss");
                None
            }
        }
    }

    async fn write_remote(&self, key: &str, value: &V, ttl: Duration) -> Result<(), CacheError> {
        let Some(l2) = self.l2.as_ref() else {
            return Ok(());
        };
        let raw = serde_json::to_string(value)?;
        l2.set(key, &raw, Some(ttl)).await?;
        Ok(())
    }

    /// L1 then L2 lookup, recording metrics and promoting L2 hits into L1
    async fn lookup(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.l1.get(key) {
            self.counters.l1_hit();
            return Some(entry.value);
        }
        self.counters.l1_miss();

        if let Some(value) = self.read_remote(key).await {
            self.counters.l2_hit();
            self.insert_local(key, value.clone(), 1, self.default_ttl);
            return Some(value);
        }
        self.counters.l2_miss();
        None
    }

    /// Look `key` up in both tiers, running `loader` on a full miss.
    ///
    /// Concurrent misses on the same key share one loader invocation; the
    /// others receive its result, error included.
    ///
    /// # Errors
    ///
    /// Returns the loader's error. Nothing is cached in that case.
    pub async fn get<F, Fut, E>(&self, key: &str, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        match self.flight.join(key) {
            Role::Waiter(waiter) => {
                if let Some(shared) = waiter.outcome().await
                    && let Some(result) = shared.downcast_ref::<Result<V, E>>()
                {
                    return result.clone();
                }
                // The leader was cancelled before publishing
                self.load(key, loader).await
            }
            Role::Leader(leader) => {
                // A flight that ended after our lookup may have filled L1
                let result = match self.l1.get(key) {
                    Some(entry) => Ok(entry.value),
                    None => self.load(key, loader).await,
                };
                leader.complete(result.clone());
                result
            }
        }
    }

    async fn load<F, Fut, E>(&self, key: &str, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let value = loader().await?;
        self.insert_local(key, value.clone(), 1, self.default_ttl);
        if let Err(e) = self.write_remote(key, &value, self.default_ttl).await {
            debug!(target: CACHE_TARGET, %key, error = %e, "L2 write-through failed");
        }
        Ok(value)
    }

    /// Both tiers, no loader
    pub async fn get_cached(&self, key: &str) -> Option<V> {
        self.lookup(key).await
    }

    /// L1 only, without touching metrics or awaiting
    #[must_use]
    pub fn peek_local(&self, key: &str) -> Option<V> {
        self.l1.get(key).map(|entry| entry.value)
    }

    /// Write both tiers with cost 1.
    ///
    /// # Errors
    ///
    /// Returns the L2 failure; L1 is written regardless.
    pub async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        self.set_with_cost(key, value, 1, ttl).await
    }

    /// Write both tiers with an explicit L1 admission cost.
    ///
    /// # Errors
    ///
    /// Returns the L2 failure; L1 is written regardless.
    pub async fn set_with_cost(
        &self,
        key: &str,
        value: V,
        cost: u32,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.insert_local(key, value.clone(), cost, ttl);
        self.write_remote(key, &value, ttl).await
    }

    /// Remove from both tiers.
    ///
    /// # Errors
    ///
    /// Returns the L2 failure; L1 is cleared regardless.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.l1.invalidate(key);
        if let Some(l2) = self.l2.as_ref() {
            l2.del(key).await?;
        }
        Ok(())
    }

    /// Drop from L1 only, leaving the shared tier to its own TTL
    pub fn forget_local(&self, key: &str) {
        self.l1.invalidate(key);
    }

    /// Drop every L1 entry whose key starts with `prefix`
    pub fn forget_local_prefix(&self, prefix: &str) {
        let keys: Vec<Arc<String>> = self
            .l1
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.l1.invalidate(key.as_str());
        }
    }

    /// Bulk-load known values into both tiers. L2 failures are logged and
    /// skipped.
    pub async fn warm_up<I>(&self, items: I, ttl: Duration)
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut loaded = 0usize;
        for (key, value) in items {
            if let Err(e) = self.set(&key, value, ttl).await {
                debug!(target: CACHE_TARGET, %key, error = %e, "Warm-up L2 write failed");
            }
            loaded += 1;
        }
        debug!(target: CACHE_TARGET, loaded, "Cache warmed");
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Run pending L1 maintenance so sizes and eviction counts settle
    pub fn sync(&self) {
        self.l1.run_pending_tasks();
    }

    #[must_use]
    pub fn local_weight(&self) -> u64 {
        self.l1.weighted_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        level: u32,
    }

    fn profile(name: &str) -> Profile {
        Profile {
            name: name.to_string(),
            level: 1,
        }
    }

    fn cache_with_kv() -> (ObjectCache<Profile>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let cache = ObjectCache::new(&CacheConfig::default(), Some(kv.clone() as Arc<dyn KvStore>));
        (cache, kv)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (cache, kv) = cache_with_kv();
        cache
            .set("p:1", profile("one"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get_cached("p:1").await, Some(profile("one")));
        assert!(kv.get("p:1").await.unwrap().is_some());

        cache.delete("p:1").await.unwrap();
        assert_eq!(cache.get_cached("p:1").await, None);
        assert!(kv.get("p:1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_one_loader() {
        let (cache, _kv) = cache_with_kv();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get("hot", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(profile("loaded"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), profile("loaded"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_shares_error() {
        let cache: ObjectCache<Profile> = ObjectCache::new(&CacheConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<Profile, _>("platform down".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap_err(), "platform down");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.peek_local("k").is_none());
    }

    #[tokio::test]
    async fn test_loader_error_not_cached() {
        let (cache, kv) = cache_with_kv();
        let result = cache
            .get("bad", || async { Err::<Profile, _>("platform down".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "platform down");
        assert!(cache.peek_local("bad").is_none());
        assert!(kv.get("bad").await.unwrap().is_none());

        let value = cache
            .get("bad", || async { Ok::<_, String>(profile("second")) })
            .await
            .unwrap();
        assert_eq!(value, profile("second"));
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let (cache, kv) = cache_with_kv();
        let raw = serde_json::to_string(&profile("remote")).unwrap();
        kv.set("p:2", &raw, None).await.unwrap();

        assert!(cache.peek_local("p:2").is_none());
        let value = cache
            .get("p:2", || async { Err::<Profile, _>("must not load") })
            .await
            .unwrap();
        assert_eq!(value, profile("remote"));
        assert_eq!(cache.peek_local("p:2"), Some(profile("remote")));

        let metrics = cache.metrics();
        assert_eq!(metrics.l1_misses, 1);
        assert_eq!(metrics.l2_hits, 1);
    }

    #[tokio::test]
    async fn test_l2_failure_is_a_miss() {
        let (cache, kv) = cache_with_kv();
        kv.set_offline(true);

        assert_eq!(cache.get_cached("p:3").await, None);
        let value = cache
            .get("p:3", || async { Ok::<_, String>(profile("fresh")) })
            .await
            .unwrap();
        assert_eq!(value, profile("fresh"));
        // L1 still serves it even though the write-through failed
        assert_eq!(cache.peek_local("p:3"), Some(profile("fresh")));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache: ObjectCache<Profile> = ObjectCache::new(&CacheConfig::default(), None);
        cache
            .set("short", profile("brief"), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(cache.peek_local("short").is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.peek_local("short").is_none());
    }

    #[tokio::test]
    async fn test_cost_budget_respected() {
        let config = CacheConfig {
            l1_max_cost: 10,
            ..Default::default()
        };
        let cache: ObjectCache<Profile> = ObjectCache::new(&config, None);
        for i in 0..50 {
            let key = format!("k:{i}");
            cache
                .set_with_cost(&key, profile("x"), 2, Duration::from_secs(60))
                .await
                .unwrap();
        }
        cache.sync();
        assert!(cache.local_weight() <= 10);
    }

    #[tokio::test]
    async fn test_forget_local_prefix() {
        let cache: ObjectCache<Profile> = ObjectCache::new(&CacheConfig::default(), None);
        let ttl = Duration::from_secs(60);
        cache.set("member:1:10", profile("a"), ttl).await.unwrap();
        cache.set("member:1:11", profile("b"), ttl).await.unwrap();
        cache.set("member:2:10", profile("c"), ttl).await.unwrap();

        cache.forget_local_prefix("member:1:");
        assert!(cache.peek_local("member:1:10").is_none());
        assert!(cache.peek_local("member:1:11").is_none());
        assert!(cache.peek_local("member:2:10").is_some());
    }

    #[tokio::test]
    async fn test_warm_up() {
        let (cache, kv) = cache_with_kv();
        cache
            .warm_up(
                vec![
                    ("w:1".to_string(), profile("one")),
                    ("w:2".to_string(), profile("two")),
                ],
                Duration::from_secs(30),
            )
            .await;
        assert_eq!(cache.peek_local("w:2"), Some(profile("two")));
        assert!(kv.get("w:1").await.unwrap().is_some());
        assert_eq!(cache.metrics().keys_added, 2);
    }
}
