//! Resolves who performed an administrative action from the guild audit log

use crate::EVENT_TARGET;
use crate::acl::{AuditEntry, Platform};
use crate::detector::EventKind;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum spacing between fetches for one guild
pub const MIN_FETCH_INTERVAL: Duration = Duration::from_millis(200);
/// Fetched entries are trusted for this long
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(5);
/// Entries requested per fetch
pub const FETCH_LIMIT: u8 = 50;

#[derive(Default)]
struct GuildLog {
    entries: Vec<AuditEntry>,
    fetched_at: Option<Instant>,
}

impl GuildLog {
    fn find(&self, action_code: u8, target_id: Option<u64>, now: Instant) -> Option<u64> {
        let fetched_at = self.fetched_at?;
        if now.saturating_duration_since(fetched_at) > MAX_ENTRY_AGE {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| {
                entry.action_code == action_code
                    && entry.user_id != 0
                    && match (target_id, entry.target_id) {
                        (Some(wanted), Some(actual)) => wanted == actual,
                        _ => true,
                    }
            })
            .map(|entry| entry.user_id)
    }
}

/// Fetch and lookup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub fetches: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetch_errors: u64,
}

/// Short-lived cache of audit-log entries, one batch per guild and action.
///
/// Lookups search the cached batch first and fall back to one fresh fetch.
/// Each (guild, action) batch is fetched at most once per
/// [`MIN_FETCH_INTERVAL`]; a lookup arriving sooner works with what is
/// cached. Different actions in one guild never share a batch, so a burst
/// of mixed events does not starve any kind of its own fetch.
pub struct AuditLogSource {
    platform: Arc<dyn Platform>,
    batches: DashMap<(u64, u8), Arc<Mutex<GuildLog>>>,
    fetches: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_errors: AtomicU64,
}

impl AuditLogSource {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            batches: DashMap::new(),
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
        }
    }

    fn batch(&self, guild_id: u64, code: u8) -> Arc<Mutex<GuildLog>> {
        self.batches
            .entry((guild_id, code))
            .or_default()
            .value()
            .clone()
    }

    /// Actor of the most recent `kind` event in `guild_id`, restricted to
    /// `target_id` when the entry names a target. Returns 0 when nothing
    /// matches or the platform cannot be reached.
    pub async fn resolve_actor(&self, guild_id: u64, kind: EventKind, target_id: Option<u64>) -> u64 {
        if guild_id == 0 {
            return 0;
        }
        let code = kind.audit_action();
        let slot = self.batch(guild_id, code);
        let mut log = slot.lock().await;

        if let Some(actor) = log.find(code, target_id, Instant::now()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return actor;
        }

        self.refresh(guild_id, code, &mut log).await;

        match log.find(code, target_id, Instant::now()) {
            Some(actor) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                actor
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: EVENT_TARGET,
                    guild_id,
                    kind = %kind,
                    target_id = ?target_id,
                    "No audit-log entry for event"
                );
                0
            }
        }
    }

    async fn refresh(&self, guild_id: u64, code: u8, log: &mut GuildLog) {
        if let Some(fetched_at) = log.fetched_at
            && fetched_at.elapsed() < MIN_FETCH_INTERVAL
        {
            return;
        }

        match self
            .platform
            .fetch_audit_entries(guild_id, code, FETCH_LIMIT)
            .await
        {
            Ok(entries) => {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                log.entries = entries;
                log.fetched_at = Some(Instant::now());
            }
            Err(error) => {
                self.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: EVENT_TARGET,
                    guild_id,
                    action_code = code,
                    error = %error,
                    "Audit-log fetch failed"
                );
            }
        }
    }

    /// Drop batches whose last fetch is older than the entry age
    pub fn purge_stale(&self) {
        let now = Instant::now();
        self.batches.retain(|_, log| match log.try_lock() {
            Ok(log) => log
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) <= MAX_ENTRY_AGE),
            Err(_) => true,
        });
    }

    /// Cached (guild, action) batches
    #[must_use]
    pub fn cached_batches(&self) -> usize {
        self.batches.len()
    }

    #[must_use]
    pub fn stats(&self) -> AuditStats {
        AuditStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }
}
