use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(super) struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    keys_added: AtomicU64,
    keys_evicted: AtomicU64,
    cost_added: AtomicU64,
    cost_evicted: AtomicU64,
}

impl Counters {
    pub(super) fn l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_add(&self, cost: u32) {
        self.keys_added.fetch_add(1, Ordering::Relaxed);
        self.cost_added.fetch_add(u64::from(cost), Ordering::Relaxed);
    }

    pub(super) fn record_eviction(&self, cost: u32) {
        self.keys_evicted.fetch_add(1, Ordering::Relaxed);
        self.cost_evicted.fetch_add(u64::from(cost), Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            keys_added: self.keys_added.load(Ordering::Relaxed),
            keys_evicted: self.keys_evicted.load(Ordering::Relaxed),
            cost_added: self.cost_added.load(Ordering::Relaxed),
            cost_evicted: self.cost_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of an object cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub keys_added: u64,
    pub keys_evicted: u64,
    pub cost_added: u64,
    pub cost_evicted: u64,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

impl CacheMetrics {
    #[must_use]
    pub fn l1_hit_rate(&self) -> f64 {
        ratio(self.l1_hits, self.l1_misses)
    }

    #[must_use]
    pub fn l2_hit_rate(&self) -> f64 {
        ratio(self.l2_hits, self.l2_misses)
    }

    /// Hits in either tier over all lookups
    #[must_use]
    pub fn overall_hit_rate(&self) -> f64 {
        ratio(self.l1_hits + self.l2_hits, self.l2_misses)
    }
}
