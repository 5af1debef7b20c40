use crate::acl::ActionKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// One punishment to execute against the platform API
#[derive(Debug, Clone, Serialize)]
pub struct PunishTask {
    pub id: Uuid,
    pub guild_id: u64,
    pub user_id: u64,
    pub kind: ActionKind,
    /// Sent as the audit-log reason when non-empty
    pub reason: String,
    /// When detection began, for end-to-end latency
    pub detection_start: DateTime<Utc>,
    /// Time spent deciding to punish
    pub detection_duration: Duration,
}

impl PunishTask {
    #[must_use]
    pub fn new(guild_id: u64, user_id: u64, kind: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            guild_id,
            user_id,
            kind,
            reason: reason.into(),
            detection_start: Utc::now(),
            detection_duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_detection(mut self, started: DateTime<Utc>, took: Duration) -> Self {
        self.detection_start = started;
        self.detection_duration = took;
        self
    }

    /// Wall-clock time since detection began
    #[must_use]
    pub fn total_latency(&self) -> Duration {
        (Utc::now() - self.detection_start)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
