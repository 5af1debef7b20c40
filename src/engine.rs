//! The process-wide enforcement engine, built once and shared by handle

use crate::acl::{ActionKind, DenyReason, PermissionCache, PermissionStats, Platform};
use crate::audit::{AuditLogSource, AuditStats};
use crate::cache::{CacheMetrics, ObjectCache};
use crate::config::{CoreConfig, KvBackend};
use crate::detector::{Detector, EventKind, Observation};
use crate::kv::{KvError, KvStore, MemoryKv, RedisKv};
use crate::notify::{ChannelSink, EnforcementLog};
use crate::pools::Pools;
use crate::punish::{
    DispatchStats, Dispatcher, PunishError, PunishReport, PunishTask, Submitted,
};
use crate::{EVENT_TARGET, PUNISH_TARGET};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often stale audit-log batches are dropped
const AUDIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no platform client configured")]
    MissingPlatform,

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Punish(#[from] PunishError),
}

/// An administrative event as delivered by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminEvent {
    pub guild_id: u64,
    pub kind: EventKind,
    /// Object the action touched, used to pick the right audit entry
    pub target_id: Option<u64>,
}

/// Cached authorization state made stale by a platform event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Roles or guild settings changed
    Guild(u64),
    /// One member's roles or membership changed
    Member { guild_id: u64, user_id: u64 },
}

/// What the engine did with one event or enforcement request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The guild has no enabled policy
    Disabled,
    /// No audit-log entry named an actor
    Unattributed,
    /// The policy found nothing to punish
    Allowed,
    Denied(DenyReason),
    Submitted(Submitted),
}

/// Aggregated counters for the stats command
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub dispatch: DispatchStats,
    pub guild_profiles: CacheMetrics,
    pub member_profiles: CacheMetrics,
    pub permissions: PermissionStats,
    pub audit: AuditStats,
    pub guild_policies: usize,
    pub detection_windows: usize,
    pub uptime: Duration,
}

pub struct CoreInner {
    bot_id: u64,
    kv: Arc<dyn KvStore>,
    permissions: PermissionCache,
    dispatcher: Dispatcher,
    detector: Arc<Detector>,
    audit: Arc<AuditLogSource>,
    pools: Arc<Pools>,
    enforcement_log: Mutex<Option<(EnforcementLog, mpsc::Receiver<PunishReport>)>>,
    shutdown: watch::Sender<bool>,
    upkeep_started: AtomicBool,
    started_at: Instant,
}

/// Shared handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct Core(Arc<CoreInner>);

impl std::ops::Deref for Core {
    type Target = CoreInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("bot_id", &self.bot_id)
            .field("guild_policies", &self.detector.guild_count())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Core`] from configuration and the platform clients
pub struct CoreBuilder {
    config: CoreConfig,
    bot_id: u64,
    platform: Option<Arc<dyn Platform>>,
    kv: Option<Arc<dyn KvStore>>,
    sink: Option<Arc<dyn ChannelSink>>,
}

impl CoreBuilder {
    #[must_use]
    pub fn new(config: CoreConfig, bot_id: u64) -> Self {
        Self {
            config,
            bot_id,
            platform: None,
            kv: None,
            sink: None,
        }
    }

    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Use this store instead of the configured backend
    #[must_use]
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Post enforcement reports through `sink`
    #[must_use]
    pub fn channel_sink(mut self, sink: Arc<dyn ChannelSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// # Errors
    ///
    /// Returns `CoreError` if no platform was given, the KV store cannot be
    /// reached, or the dispatcher cannot be built.
    pub async fn build(self) -> Result<Core, CoreError> {
        let config = self.config;
        let platform = self.platform.ok_or(CoreError::MissingPlatform)?;

        let kv: Arc<dyn KvStore> = match (self.kv, config.kv_backend) {
            (Some(kv), _) => kv,
            (None, KvBackend::Redis) => Arc::new(RedisKv::connect(&config.kv).await?),
            (None, KvBackend::Memory) => Arc::new(MemoryKv::new()),
        };

        let permissions = PermissionCache::new(
            self.bot_id,
            Arc::clone(&platform),
            ObjectCache::new(&config.cache, Some(Arc::clone(&kv))),
            ObjectCache::new(&config.cache, Some(Arc::clone(&kv))),
            Some(Arc::clone(&kv)),
            &config.permissions,
        );
        let detector = Arc::new(Detector::new(self.bot_id, config.guilds));
        let pools = Arc::new(Pools::new());

        let (dispatcher, enforcement_log) = match self.sink {
            Some(sink) => {
                let (tx, rx) = mpsc::channel(config.notify.queue_capacity.max(1));
                let dispatcher = Dispatcher::with_reporter(&config.dispatcher, &config.token, tx)?;
                let log = EnforcementLog::new(
                    Arc::clone(&detector),
                    Arc::clone(&pools),
                    sink,
                    config.notify,
                );
                (dispatcher, Some((log, rx)))
            }
            None => (Dispatcher::new(&config.dispatcher, &config.token)?, None),
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Core(Arc::new(CoreInner {
            bot_id: self.bot_id,
            kv,
            permissions,
            dispatcher,
            detector,
            audit: Arc::new(AuditLogSource::new(platform)),
            pools,
            enforcement_log: Mutex::new(enforcement_log),
            shutdown,
            upkeep_started: AtomicBool::new(false),
            started_at: Instant::now(),
        })))
    }
}

impl Core {
    #[must_use]
    pub fn bot_id(&self) -> u64 {
        self.bot_id
    }

    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    #[must_use]
    pub fn permissions(&self) -> &PermissionCache {
        &self.permissions
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogSource {
        &self.audit
    }

    #[must_use]
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Start the dispatcher workers and background upkeep. Later calls only
    /// return the handles of tasks not yet started.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.dispatcher.start();

        if let Some((log, reports)) = self.enforcement_log.lock().take() {
            handles.push(log.spawn(reports, self.shutdown.subscribe()));
        }

        if !self.upkeep_started.swap(true, Ordering::SeqCst) {
            let audit = Arc::clone(&self.audit);
            let mut shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(AUDIT_PURGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => audit.purge_stale(),
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
        handles
    }

    /// Stop workers and background tasks
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.shutdown.send_replace(true);
        info!(target: EVENT_TARGET, "Enforcement engine shutting down");
    }

    /// Drop permission state a platform change has made stale
    pub async fn invalidate(&self, invalidation: Invalidation) {
        match invalidation {
            Invalidation::Guild(guild_id) => self.permissions.invalidate_guild(guild_id).await,
            Invalidation::Member { guild_id, user_id } => {
                self.permissions.invalidate_member(guild_id, user_id).await;
            }
        }
    }

    /// Attribute, judge and, if called for, punish one administrative event.
    ///
    /// `actor_roles` is asked for the resolved actor's role ids; only
    /// whitelisted roles matter, so an empty list is a safe answer.
    pub async fn on_event<F>(&self, event: AdminEvent, actor_roles: F) -> Outcome
    where
        F: FnOnce(u64) -> Vec<u64>,
    {
        let started = Instant::now();
        let wall_start = Utc::now();
        if !self.detector.is_enabled(event.guild_id) {
            return Outcome::Disabled;
        }

        let actor_id = self
            .audit
            .resolve_actor(event.guild_id, event.kind, event.target_id)
            .await;
        if actor_id == 0 {
            return Outcome::Unattributed;
        }

        let observation = Observation {
            guild_id: event.guild_id,
            kind: event.kind,
            actor_id,
            owner_id: self
                .permissions
                .peek_guild(event.guild_id)
                .map(|guild| guild.owner_id),
            actor_roles: actor_roles(actor_id),
        };
        let Some(verdict) = self.detector.evaluate(&observation) else {
            return Outcome::Allowed;
        };

        info!(
            target: EVENT_TARGET,
            guild_id = event.guild_id,
            actor_id,
            kind = %event.kind,
            count = verdict.count,
            limit = verdict.limit,
            punishment = %verdict.punishment,
            "Anti-nuke limit exceeded"
        );
        let task = PunishTask::new(event.guild_id, actor_id, verdict.punishment, verdict.reason)
            .with_detection(wall_start, started.elapsed());
        self.enforce(task).await
    }

    /// Authorize a punishment against cached guild state and hand it to the
    /// dispatcher
    pub async fn enforce(&self, task: PunishTask) -> Outcome {
        let decision = self
            .permissions
            .validate(task.guild_id, task.user_id, task.kind)
            .await;
        if !decision.permitted {
            let reason = decision.reason.unwrap_or(DenyReason::CachedDenial);
            warn!(
                target: PUNISH_TARGET,
                guild_id = task.guild_id,
                user_id = task.user_id,
                kind = %task.kind,
                reason = %reason,
                "Punishment not permitted"
            );
            return Outcome::Denied(reason);
        }

        let submitted = self.dispatcher.submit(task);
        debug!(target: PUNISH_TARGET, ?submitted, "Punishment submitted");
        Outcome::Submitted(submitted)
    }

    /// Shorthand for [`Self::enforce`] without detection timing
    pub async fn punish(
        &self,
        guild_id: u64,
        user_id: u64,
        kind: ActionKind,
        reason: impl Into<String>,
    ) -> Outcome {
        self.enforce(PunishTask::new(guild_id, user_id, kind, reason))
            .await
    }

    #[must_use]
    pub fn stats(&self) -> CoreStats {
        let (guild_profiles, member_profiles) = self.permissions.profile_metrics();
        CoreStats {
            dispatch: self.dispatcher.stats(),
            guild_profiles,
            member_profiles,
            permissions: self.permissions.stats(),
            audit: self.audit.stats(),
            guild_policies: self.detector.guild_count(),
            detection_windows: self.detector.window_count(),
            uptime: self.started_at.elapsed(),
        }
    }
}
