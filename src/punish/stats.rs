use crate::acl::ActionKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(super) struct Counters {
    submitted: AtomicU64,
    bans_completed: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    queue_dropped: AtomicU64,
    api_latency_us: AtomicU64,
}

impl Counters {
    pub(super) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn dropped(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn completed(&self, kind: ActionKind, api_latency: Duration) {
        if kind == ActionKind::Ban {
            self.bans_completed.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(api_latency.as_micros()).unwrap_or(u64::MAX);
        self.api_latency_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self, queued: usize) -> DispatchStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let total_us = self.api_latency_us.load(Ordering::Relaxed);
        let mean_api_latency = total_us
            .checked_div(completed)
            .map_or(Duration::ZERO, Duration::from_micros);

        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            bans_completed: self.bans_completed.load(Ordering::Relaxed),
            completed,
            errors: self.errors.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            queued,
            mean_api_latency,
        }
    }
}

/// Read-only view of the dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    pub bans_completed: u64,
    /// Successful executions of any kind
    pub completed: u64,
    pub errors: u64,
    pub queue_dropped: u64,
    /// Tasks waiting in the queue right now
    pub queued: usize,
    /// Mean API latency over successful executions
    pub mean_api_latency: Duration,
}
