//! Derived per-member authorization decisions

use super::action::ActionKind;
use super::platform::{Platform, PlatformError};
use super::profile::{GuildProfile, MemberProfile};
use crate::ACL_TARGET;
use crate::cache::{CacheMetrics, ObjectCache};
use crate::kv::KvStore;
use crate::snowflake;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Decisions never outlive this
pub const MAX_DECISION_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Clamped to two minutes
    pub decision_ttl_secs: u64,
    pub profile_ttl_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            decision_ttl_secs: 120,
            profile_ttl_secs: 300,
        }
    }
}

impl PermissionConfig {
    #[must_use]
    pub fn decision_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_ttl_secs).min(MAX_DECISION_TTL)
    }

    #[must_use]
    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_ttl_secs)
    }
}

/// Why a punishment was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    GuildOwner,
    TargetAdministrator,
    Hierarchy,
    BotLacksPermission,
    /// A shared-store decision of "0" carries no reason
    CachedDenial,
    GuildUnavailable,
    BotMemberUnavailable,
    TargetUnavailable,
}

impl DenyReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuildOwner => "target is guild owner",
            Self::TargetAdministrator => "target has Administrator",
            Self::Hierarchy => "target role position not below bot",
            Self::BotLacksPermission => "bot lacks required permission",
            Self::CachedDenial => "denied by cached decision",
            Self::GuildUnavailable => "failed to fetch guild",
            Self::BotMemberUnavailable => "failed to fetch bot member",
            Self::TargetUnavailable => "target not found or left guild",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub permitted: bool,
    pub reason: Option<DenyReason>,
}

impl Decision {
    #[must_use]
    pub const fn permit() -> Self {
        Self {
            permitted: true,
            reason: None,
        }
    }

    #[must_use]
    pub const fn deny(reason: DenyReason) -> Self {
        Self {
            permitted: false,
            reason: Some(reason),
        }
    }

    /// Empty when permitted
    #[must_use]
    pub fn reason_str(&self) -> &'static str {
        self.reason.map_or("", DenyReason::as_str)
    }
}

type DecisionKey = (u64, u64, ActionKind);

#[derive(Debug, Clone, Copy)]
struct CachedDecision {
    decision: Decision,
    expires_at: Instant,
}

/// Owner, Administrator, hierarchy and bot permission checks, in that order
#[must_use]
pub fn evaluate(
    guild: &GuildProfile,
    target: &MemberProfile,
    bot: &MemberProfile,
    action: ActionKind,
) -> Decision {
    if target.user_id == guild.owner_id {
        return Decision::deny(DenyReason::GuildOwner);
    }
    if target.has_admin {
        return Decision::deny(DenyReason::TargetAdministrator);
    }
    if target.highest_role_position >= bot.highest_role_position {
        return Decision::deny(DenyReason::Hierarchy);
    }
    if !guild.has_permission(bot, action) {
        return Decision::deny(DenyReason::BotLacksPermission);
    }
    Decision::permit()
}

#[must_use]
pub fn guild_key(guild_id: u64) -> String {
    let mut key = String::with_capacity(40);
    key.push_str("guild_profile:");
    snowflake::push_decimal(&mut key, guild_id);
    key
}

#[must_use]
pub fn member_key(guild_id: u64, user_id: u64) -> String {
    let mut key = String::with_capacity(60);
    key.push_str("member_profile:");
    snowflake::push_decimal(&mut key, guild_id);
    key.push(':');
    snowflake::push_decimal(&mut key, user_id);
    key
}

#[must_use]
pub fn bot_member_key(guild_id: u64) -> String {
    let mut key = String::with_capacity(40);
    key.push_str("bot_member:");
    snowflake::push_decimal(&mut key, guild_id);
    key
}

#[must_use]
pub fn decision_key(guild_id: u64, user_id: u64, action: ActionKind) -> String {
    let mut key = String::with_capacity(72);
    key.push_str("acl_perm:");
    snowflake::push_decimal(&mut key, guild_id);
    key.push(':');
    snowflake::push_decimal(&mut key, user_id);
    key.push(':');
    key.push_str(action.as_str());
    key
}

/// Hit/miss counters of the decision cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PermissionStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_decisions: usize,
}

struct Inner {
    bot_id: u64,
    platform: Arc<dyn Platform>,
    guilds: ObjectCache<GuildProfile>,
    members: ObjectCache<MemberProfile>,
    decisions: DashMap<DecisionKey, CachedDecision>,
    kv: Option<Arc<dyn KvStore>>,
    decision_ttl: Duration,
    profile_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Answers "may the bot punish user U in guild G with action A".
///
/// Decisions live in a local map and are written through to the shared
/// store as `acl_perm:{g}:{u}:{a}`. Profiles come from the object caches
/// and, on the detailed path, from the platform.
#[derive(Clone)]
pub struct PermissionCache(Arc<Inner>);

impl PermissionCache {
    #[must_use]
    pub fn new(
        bot_id: u64,
        platform: Arc<dyn Platform>,
        guilds: ObjectCache<GuildProfile>,
        members: ObjectCache<MemberProfile>,
        kv: Option<Arc<dyn KvStore>>,
        config: &PermissionConfig,
    ) -> Self {
        Self(Arc::new(Inner {
            bot_id,
            platform,
            guilds,
            members,
            decisions: DashMap::new(),
            kv,
            decision_ttl: config.decision_ttl(),
            profile_ttl: config.profile_ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub fn bot_id(&self) -> u64 {
        self.0.bot_id
    }

    /// Cached guild profile, L1 only
    #[must_use]
    pub fn peek_guild(&self, guild_id: u64) -> Option<GuildProfile> {
        self.0.guilds.peek_local(&guild_key(guild_id))
    }

    /// Hot/cold metrics of the guild and member profile caches
    #[must_use]
    pub fn profile_metrics(&self) -> (CacheMetrics, CacheMetrics) {
        (self.0.guilds.metrics(), self.0.members.metrics())
    }

    #[must_use]
    pub fn stats(&self) -> PermissionStats {
        PermissionStats {
            hits: self.0.hits.load(Ordering::Relaxed),
            misses: self.0.misses.load(Ordering::Relaxed),
            cached_decisions: self.0.decisions.len(),
        }
    }

    /// Decide whether `action` may be applied to `user_id` in `guild_id`.
    pub async fn validate(&self, guild_id: u64, user_id: u64, action: ActionKind) -> Decision {
        if let Some(decision) = self.cached(guild_id, user_id, action).await {
            self.0.hits.fetch_add(1, Ordering::Relaxed);
            return decision;
        }
        self.0.misses.fetch_add(1, Ordering::Relaxed);

        if action == ActionKind::Ban
            && let Some(decision) = self.fast_path(guild_id, user_id, action)
        {
            self.remember(guild_id, user_id, action, decision);
            return decision;
        }

        let decision = match self.detailed_path(guild_id, user_id, action).await {
            Ok(decision) => decision,
            Err(reason) => {
                debug!(target: ACL_TARGET, guild_id, user_id, %action, %reason, "Validation fetch failed");
                return Decision::deny(reason);
            }
        };
        self.remember(guild_id, user_id, action, decision);
        decision
    }

    async fn cached(&self, guild_id: u64, user_id: u64, action: ActionKind) -> Option<Decision> {
        let key = (guild_id, user_id, action);
        if let Some(entry) = self.0.decisions.get(&key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.decision);
            }
        }
        self.0.decisions.remove_if(&key, |_, e| e.expires_at <= Instant::now());

        let kv = self.0.kv.as_ref()?;
        match kv.get(&decision_key(guild_id, user_id, action)).await {
            Ok(Some(v)) if v == "1" => Some(Decision::permit()),
            Ok(Some(v)) if v == "0" => Some(Decision::deny(DenyReason::CachedDenial)),
            Ok(_) => None,
            Err(e) => {
                debug!(target: ACL_TARGET, error = %e, "Decision lookup failed, treated as miss");
                None
            }
        }
    }

    /// In-memory evaluation when every input is already in L1
    fn fast_path(&self, guild_id: u64, user_id: u64, action: ActionKind) -> Option<Decision> {
        let guild = self.0.guilds.peek_local(&guild_key(guild_id))?;
        if user_id == guild.owner_id {
            return Some(Decision::deny(DenyReason::GuildOwner));
        }
        let target = self.0.members.peek_local(&member_key(guild_id, user_id))?;
        let bot = self.0.members.peek_local(&bot_member_key(guild_id))?;
        let target = guild.rederive(target);
        let bot = guild.rederive(bot);
        Some(evaluate(&guild, &target, &bot, action))
    }

    async fn detailed_path(
        &self,
        guild_id: u64,
        user_id: u64,
        action: ActionKind,
    ) -> Result<Decision, DenyReason> {
        let guild = self.load_guild(guild_id).await.map_err(|e| {
            warn!(target: ACL_TARGET, guild_id, error = %e, "Guild fetch failed");
            DenyReason::GuildUnavailable
        })?;

        let bot = self
            .load_member(&guild, bot_member_key(guild_id), self.0.bot_id)
            .await
            .map_err(|_| DenyReason::BotMemberUnavailable)?;

        let target = if user_id == self.0.bot_id {
            bot.clone()
        } else {
            self.load_member(&guild, member_key(guild_id, user_id), user_id)
                .await
                .map_err(|_| DenyReason::TargetUnavailable)?
        };

        Ok(evaluate(&guild, &target, &bot, action))
    }

    async fn load_guild(&self, guild_id: u64) -> Result<GuildProfile, PlatformError> {
        let platform = Arc::clone(&self.0.platform);
        self.0
            .guilds
            .get(&guild_key(guild_id), || async move {
                platform.fetch_guild(guild_id).await
            })
            .await
    }

    /// Cached member profile rederived against `guild`, or fetch and cache
    /// it in the background
    async fn load_member(
        &self,
        guild: &GuildProfile,
        key: String,
        user_id: u64,
    ) -> Result<MemberProfile, PlatformError> {
        if let Some(profile) = self.0.members.get_cached(&key).await {
            return Ok(guild.rederive(profile));
        }

        let roles = self
            .0
            .platform
            .fetch_member_roles(guild.guild_id, user_id)
            .await?;
        let profile = guild.build_member(user_id, roles);

        let members = self.0.members.clone();
        let ttl = self.0.profile_ttl;
        let cached = profile.clone();
        tokio::spawn(async move {
            if let Err(e) = members.set(&key, cached, ttl).await {
                debug!(target: ACL_TARGET, %key, error = %e, "Member profile write failed");
            }
        });
        Ok(profile)
    }

    fn remember(&self, guild_id: u64, user_id: u64, action: ActionKind, decision: Decision) {
        let ttl = self.0.decision_ttl;
        self.0.decisions.insert(
            (guild_id, user_id, action),
            CachedDecision {
                decision,
                expires_at: Instant::now() + ttl,
            },
        );

        if let Some(kv) = self.0.kv.clone() {
            let key = decision_key(guild_id, user_id, action);
            let value = if decision.permitted { "1" } else { "0" };
            tokio::spawn(async move {
                if let Err(e) = kv.set(&key, value, Some(ttl)).await {
                    debug!(target: ACL_TARGET, %key, error = %e, "Decision write-through failed");
                }
            });
        }
    }

    async fn forget_decisions<F>(&self, mut matches: F)
    where
        F: FnMut(&DecisionKey) -> bool,
    {
        let mut dropped = Vec::new();
        self.0.decisions.retain(|key, _| {
            if matches(key) {
                dropped.push(*key);
                false
            } else {
                true
            }
        });

        let Some(kv) = self.0.kv.as_ref() else {
            return;
        };
        for (g, u, a) in dropped {
            if let Err(e) = kv.del(&decision_key(g, u, a)).await {
                debug!(target: ACL_TARGET, error = %e, "Decision delete failed");
            }
        }
    }

    /// Flush everything derived from one member. Invalidating the bot drops
    /// its profile and every decision in the guild, since all of them
    /// depend on the bot's position.
    pub async fn invalidate_member(&self, guild_id: u64, user_id: u64) {
        if user_id == self.0.bot_id {
            if let Err(e) = self.0.members.delete(&bot_member_key(guild_id)).await {
                debug!(target: ACL_TARGET, error = %e, "Bot profile delete failed");
            }
            self.forget_decisions(|(g, _, _)| *g == guild_id).await;
        } else {
            self.forget_decisions(|(g, u, _)| *g == guild_id && *u == user_id)
                .await;
        }

        // Stale remote decisions outside the local map still expire by TTL
        for action in ActionKind::ALL {
            if let Some(kv) = self.0.kv.as_ref()
                && let Err(e) = kv.del(&decision_key(guild_id, user_id, action)).await
            {
                debug!(target: ACL_TARGET, error = %e, "Decision delete failed");
            }
        }

        if let Err(e) = self.0.members.delete(&member_key(guild_id, user_id)).await {
            debug!(target: ACL_TARGET, error = %e, "Member profile delete failed");
        }
        debug!(target: ACL_TARGET, guild_id, user_id, "Member permissions invalidated");
    }

    /// Flush the guild profile, the bot's profile and every decision for the
    /// guild from both tiers. Other member profiles keep only their role
    /// lists in use; position and Administrator are rederived from the
    /// reloaded role table on every read.
    pub async fn invalidate_guild(&self, guild_id: u64) {
        if let Err(e) = self.0.guilds.delete(&guild_key(guild_id)).await {
            debug!(target: ACL_TARGET, error = %e, "Guild profile delete failed");
        }
        if let Err(e) = self.0.members.delete(&bot_member_key(guild_id)).await {
            debug!(target: ACL_TARGET, error = %e, "Bot profile delete failed");
        }
        let mut prefix = member_key(guild_id, 0);
        prefix.pop();
        self.0.members.forget_local_prefix(&prefix);
        self.forget_decisions(|(g, _, _)| *g == guild_id).await;
        debug!(target: ACL_TARGET, guild_id, "Guild permissions invalidated");
    }

    /// Warm a guild in the background
    pub fn prewarm(&self, guild_id: u64) {
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.prewarm_now(guild_id).await {
                warn!(target: ACL_TARGET, guild_id, error = %e, "Permission warm-up failed");
            }
        });
    }

    /// Fetch owner, role table and the bot's member profile, then record
    /// positive decisions for the bot over every action kind.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the guild or bot member cannot be
    /// fetched. Nothing is recorded in that case.
    pub async fn prewarm_now(&self, guild_id: u64) -> Result<(), PlatformError> {
        let guild = self.0.platform.fetch_guild(guild_id).await?;
        let roles = self
            .0
            .platform
            .fetch_member_roles(guild_id, self.0.bot_id)
            .await?;
        let bot = guild.build_member(self.0.bot_id, roles);
        let ttl = self.0.profile_ttl;

        self.0
            .guilds
            .warm_up([(guild_key(guild_id), guild)], ttl)
            .await;
        self.0
            .members
            .warm_up([(bot_member_key(guild_id), bot)], ttl)
            .await;

        for action in ActionKind::ALL {
            self.remember(guild_id, self.0.bot_id, action, Decision::permit());
        }
        info!(target: ACL_TARGET, guild_id, "Permission cache warmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::ADMINISTRATOR;
    use crate::acl::platform::MockPlatform;
    use crate::acl::profile::RoleInfo;
    use crate::acl::profile::fixtures::*;
    use crate::cache::CacheConfig;
    use crate::kv::MemoryKv;
    use std::sync::atomic::AtomicBool;

    const TARGET: u64 = 50;

    fn permission_cache(platform: MockPlatform, kv: Option<Arc<dyn KvStore>>) -> PermissionCache {
        let config = CacheConfig::default();
        PermissionCache::new(
            BOT,
            Arc::new(platform),
            ObjectCache::new(&config, kv.clone()),
            ObjectCache::new(&config, kv.clone()),
            kv,
            &PermissionConfig::default(),
        )
    }

    async fn wait_for_key(kv: &MemoryKv, key: &str) {
        for _ in 0..50 {
            if kv.get(key).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{key} was never written");
    }

    /// Fixture guild whose member role can be changed between fetches
    fn changing_guild(change: fn(&mut RoleInfo)) -> (MockPlatform, Arc<AtomicBool>) {
        let changed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&changed);
        let mut platform = MockPlatform::new();
        platform.expect_fetch_guild().returning(move |_| {
            let mut guild = guild();
            if flag.load(Ordering::SeqCst)
                && let Some(role) = guild.role_table.get_mut(&ROLE_MEMBER)
            {
                change(role);
            }
            Ok(guild)
        });
        platform
            .expect_fetch_member_roles()
            .returning(|_, user| Ok(if user == BOT { vec![ROLE_BOT] } else { vec![ROLE_MEMBER] }));
        (platform, changed)
    }

    /// Platform that knows the fixture guild and a set of members
    fn platform_with(members: Vec<(u64, Vec<u64>)>) -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform.expect_fetch_guild().returning(|_| Ok(guild()));
        platform
            .expect_fetch_member_roles()
            .returning(move |_, user| {
                members
                    .iter()
                    .find(|(id, _)| *id == user)
                    .map(|(_, roles)| roles.clone())
                    .ok_or_else(|| PlatformError::Request("unknown member".to_string()))
            });
        platform
    }

    #[test]
    fn test_evaluate_order() {
        let guild = guild();
        let bot = guild.build_member(BOT, vec![ROLE_BOT]);

        let owner = guild.build_member(OWNER, vec![ROLE_ADMIN]);
        assert_eq!(
            evaluate(&guild, &owner, &bot, ActionKind::Ban).reason,
            Some(DenyReason::GuildOwner)
        );

        let admin = guild.build_member(TARGET, vec![ROLE_ADMIN]);
        assert_eq!(
            evaluate(&guild, &admin, &bot, ActionKind::Ban).reason,
            Some(DenyReason::TargetAdministrator)
        );

        let above = guild.build_member(TARGET, vec![ROLE_TOP]);
        assert_eq!(
            evaluate(&guild, &above, &bot, ActionKind::Ban).reason,
            Some(DenyReason::Hierarchy)
        );

        let plain = guild.build_member(TARGET, vec![ROLE_MEMBER]);
        assert_eq!(evaluate(&guild, &plain, &bot, ActionKind::Ban), Decision::permit());
    }

    #[test]
    fn test_equal_position_denies() {
        let guild = guild();
        let bot = guild.build_member(BOT, vec![ROLE_BOT]);
        let peer = guild.build_member(TARGET, vec![ROLE_BOT]);
        assert_eq!(
            evaluate(&guild, &peer, &bot, ActionKind::Kick).reason,
            Some(DenyReason::Hierarchy)
        );
    }

    #[test]
    fn test_bot_lacks_permission() {
        let guild = guild();
        // Moderator role only carries kick
        let bot = guild.build_member(BOT, vec![ROLE_MOD]);
        let plain = guild.build_member(TARGET, vec![ROLE_MEMBER]);
        assert!(evaluate(&guild, &plain, &bot, ActionKind::Kick).permitted);
        assert_eq!(
            evaluate(&guild, &plain, &bot, ActionKind::Ban).reason_str(),
            "bot lacks required permission"
        );
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(decision_key(1, 2, ActionKind::Ban), "acl_perm:1:2:BAN");
        assert_eq!(guild_key(9), "guild_profile:9");
        assert_eq!(member_key(9, 0), "member_profile:9:0");
        assert_eq!(bot_member_key(9), "bot_member:9");
    }

    #[test]
    fn test_decision_ttl_clamped() {
        let config = PermissionConfig {
            decision_ttl_secs: 3600,
            ..Default::default()
        };
        assert_eq!(config.decision_ttl(), MAX_DECISION_TTL);
    }

    #[tokio::test]
    async fn test_detailed_path_then_cached() {
        let cache = permission_cache(
            platform_with(vec![(BOT, vec![ROLE_BOT]), (TARGET, vec![ROLE_MEMBER])]),
            None,
        );

        let decision = cache.validate(GUILD, TARGET, ActionKind::Kick).await;
        assert!(decision.permitted);
        assert_eq!(cache.stats().misses, 1);

        let again = cache.validate(GUILD, TARGET, ActionKind::Kick).await;
        assert!(again.permitted);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_not_cached() {
        let mut platform = MockPlatform::new();
        platform
            .expect_fetch_guild()
            .times(2)
            .returning(|_| Err(PlatformError::Request("down".to_string())));
        let cache = permission_cache(platform, None);

        let decision = cache.validate(GUILD, TARGET, ActionKind::Ban).await;
        assert_eq!(decision.reason, Some(DenyReason::GuildUnavailable));
        let decision = cache.validate(GUILD, TARGET, ActionKind::Ban).await;
        assert!(!decision.permitted);
        assert_eq!(cache.stats().cached_decisions, 0);
    }

    #[tokio::test]
    async fn test_missing_target_denies() {
        let cache = permission_cache(platform_with(vec![(BOT, vec![ROLE_BOT])]), None);
        let decision = cache.validate(GUILD, TARGET, ActionKind::Ban).await;
        assert_eq!(decision.reason, Some(DenyReason::TargetUnavailable));
    }

    #[tokio::test]
    async fn test_prewarm_then_bot_validates_without_fetch() {
        let mut platform = MockPlatform::new();
        platform.expect_fetch_guild().times(1).returning(|_| Ok(guild()));
        platform
            .expect_fetch_member_roles()
            .times(1)
            .returning(|_, _| Ok(vec![ROLE_BOT]));
        let cache = permission_cache(platform, None);

        cache.prewarm_now(GUILD).await.unwrap();
        for action in ActionKind::ALL {
            assert!(cache.validate(GUILD, BOT, action).await.permitted);
        }
        assert_eq!(cache.stats().hits, 4);
    }

    #[tokio::test]
    async fn test_fast_path_uses_local_profiles() {
        let mut platform = MockPlatform::new();
        platform.expect_fetch_guild().times(1).returning(|_| Ok(guild()));
        platform
            .expect_fetch_member_roles()
            .times(1)
            .returning(|_, _| Ok(vec![ROLE_BOT]));
        let cache = permission_cache(platform, None);
        cache.prewarm_now(GUILD).await.unwrap();

        let guild = guild();
        let ttl = Duration::from_secs(60);
        cache
            .0
            .members
            .set(&member_key(GUILD, TARGET), guild.build_member(TARGET, vec![ROLE_MOD]), ttl)
            .await
            .unwrap();
        cache
            .0
            .members
            .set(&member_key(GUILD, 51), guild.build_member(51, vec![ROLE_TOP]), ttl)
            .await
            .unwrap();

        assert!(cache.validate(GUILD, TARGET, ActionKind::Ban).await.permitted);
        assert_eq!(
            cache.validate(GUILD, 51, ActionKind::Ban).await.reason,
            Some(DenyReason::Hierarchy)
        );
        assert_eq!(
            cache.validate(GUILD, OWNER, ActionKind::Ban).await.reason,
            Some(DenyReason::GuildOwner)
        );
    }

    #[tokio::test]
    async fn test_invalidate_member_forces_refetch() {
        let mut platform = MockPlatform::new();
        platform.expect_fetch_guild().returning(|_| Ok(guild()));
        platform
            .expect_fetch_member_roles()
            .returning(|_, user| Ok(if user == BOT { vec![ROLE_BOT] } else { vec![ROLE_MEMBER] }));
        let cache = permission_cache(platform, None);

        assert!(cache.validate(GUILD, TARGET, ActionKind::Kick).await.permitted);
        assert_eq!(cache.stats().cached_decisions, 1);

        cache.invalidate_member(GUILD, TARGET).await;
        assert_eq!(cache.stats().cached_decisions, 0);

        assert!(cache.validate(GUILD, TARGET, ActionKind::Kick).await.permitted);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_invalidate_bot_drops_guild_decisions() {
        let mut platform = MockPlatform::new();
        platform.expect_fetch_guild().returning(|_| Ok(guild()));
        platform
            .expect_fetch_member_roles()
            .returning(|_, user| Ok(if user == BOT { vec![ROLE_BOT] } else { vec![ROLE_MEMBER] }));
        let cache = permission_cache(platform, None);
        cache.prewarm_now(GUILD).await.unwrap();
        cache.validate(GUILD, TARGET, ActionKind::Kick).await;
        assert_eq!(cache.stats().cached_decisions, 5);

        cache.invalidate_member(GUILD, BOT).await;
        assert_eq!(cache.stats().cached_decisions, 0);
        assert!(cache.0.members.peek_local(&bot_member_key(GUILD)).is_none());
    }

    #[tokio::test]
    async fn test_decisions_written_through_to_kv() {
        let kv = Arc::new(MemoryKv::new());
        let cache = permission_cache(
            platform_with(vec![(BOT, vec![ROLE_BOT]), (TARGET, vec![ROLE_TOP])]),
            Some(kv.clone() as Arc<dyn KvStore>),
        );

        let decision = cache.validate(GUILD, TARGET, ActionKind::Ban).await;
        assert_eq!(decision.reason, Some(DenyReason::Hierarchy));

        // Write-through runs on a spawned task
        wait_for_key(&kv, "acl_perm:1000:50:BAN").await;
        assert_eq!(
            kv.get("acl_perm:1000:50:BAN").await.unwrap().as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_kv_decision_hit() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("acl_perm:1000:50:KICK", "1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let cache = permission_cache(MockPlatform::new(), Some(kv as Arc<dyn KvStore>));

        assert!(cache.validate(GUILD, TARGET, ActionKind::Kick).await.permitted);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_role_gaining_admin_denies_after_guild_invalidation() {
        let kv = Arc::new(MemoryKv::new());
        let (platform, changed) = changing_guild(|role| role.permissions = ADMINISTRATOR);
        let cache = permission_cache(platform, Some(kv.clone() as Arc<dyn KvStore>));

        assert!(cache.validate(GUILD, TARGET, ActionKind::Kick).await.permitted);
        wait_for_key(&kv, "member_profile:1000:50").await;
        wait_for_key(&kv, "acl_perm:1000:50:KICK").await;

        changed.store(true, Ordering::SeqCst);
        cache.invalidate_guild(GUILD).await;

        // The shared tier still holds the profile built from the old roles
        assert!(kv.get("member_profile:1000:50").await.unwrap().is_some());
        let decision = cache.validate(GUILD, TARGET, ActionKind::Kick).await;
        assert_eq!(decision.reason, Some(DenyReason::TargetAdministrator));
    }

    #[tokio::test]
    async fn test_role_moved_above_bot_denies_on_fast_path() {
        let kv = Arc::new(MemoryKv::new());
        let (platform, changed) = changing_guild(|role| role.position = 15);
        let cache = permission_cache(platform, Some(kv.clone() as Arc<dyn KvStore>));
        cache.prewarm_now(GUILD).await.unwrap();

        let stale = guild().build_member(TARGET, vec![ROLE_MEMBER]);
        let ttl = Duration::from_secs(60);
        cache.0.members.set(&member_key(GUILD, TARGET), stale, ttl).await.unwrap();
        assert_eq!(cache.fast_path(GUILD, TARGET, ActionKind::Ban), Some(Decision::permit()));

        changed.store(true, Ordering::SeqCst);
        cache.invalidate_guild(GUILD).await;
        cache.prewarm_now(GUILD).await.unwrap();
        cache
            .0
            .members
            .set(&member_key(GUILD, TARGET), guild().build_member(TARGET, vec![ROLE_MEMBER]), ttl)
            .await
            .unwrap();

        assert_eq!(
            cache.fast_path(GUILD, TARGET, ActionKind::Ban),
            Some(Decision::deny(DenyReason::Hierarchy))
        );
        assert_eq!(
            cache.validate(GUILD, TARGET, ActionKind::Ban).await.reason,
            Some(DenyReason::Hierarchy)
        );
    }

    #[tokio::test]
    async fn test_invalidate_guild_flushes_both_tiers() {
        let kv = Arc::new(MemoryKv::new());
        let (platform, _) = changing_guild(|_| {});
        let cache = permission_cache(platform, Some(kv.clone() as Arc<dyn KvStore>));
        cache.prewarm_now(GUILD).await.unwrap();
        assert!(cache.validate(GUILD, TARGET, ActionKind::Kick).await.permitted);
        wait_for_key(&kv, "member_profile:1000:50").await;
        wait_for_key(&kv, "acl_perm:1000:50:KICK").await;
        wait_for_key(&kv, "acl_perm:1000:2:BAN").await;

        cache.invalidate_guild(GUILD).await;

        assert_eq!(cache.stats().cached_decisions, 0);
        assert!(cache.peek_guild(GUILD).is_none());
        assert!(cache.0.members.peek_local(&member_key(GUILD, TARGET)).is_none());
        for key in [
            "guild_profile:1000",
            "bot_member:1000",
            "acl_perm:1000:50:KICK",
            "acl_perm:1000:2:BAN",
        ] {
            assert!(kv.get(key).await.unwrap().is_none(), "{key} survived");
        }
    }

    #[tokio::test]
    async fn test_invalidate_member_flushes_both_tiers() {
        let kv = Arc::new(MemoryKv::new());
        let (platform, _) = changing_guild(|_| {});
        let cache = permission_cache(platform, Some(kv.clone() as Arc<dyn KvStore>));
        assert!(cache.validate(GUILD, TARGET, ActionKind::Kick).await.permitted);
        wait_for_key(&kv, "member_profile:1000:50").await;
        wait_for_key(&kv, "acl_perm:1000:50:KICK").await;

        cache.invalidate_member(GUILD, TARGET).await;

        assert_eq!(cache.stats().cached_decisions, 0);
        assert!(kv.get("member_profile:1000:50").await.unwrap().is_none());
        assert!(kv.get("acl_perm:1000:50:KICK").await.unwrap().is_none());
        assert!(kv.get("guild_profile:1000").await.unwrap().is_some());
    }
}
