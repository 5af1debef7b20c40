//! Detection policy: decides whether an attributed administrative event
//! calls for a punishment

use crate::acl::ActionKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Timestamps kept per window
const WINDOW_CAPACITY: usize = 128;

/// Administrative events the interpreter watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChannelCreate,
    ChannelDelete,
    ChannelUpdate,
    RoleCreate,
    RoleDelete,
    RoleUpdate,
    MemberBan,
    MemberKick,
    BotAdd,
    WebhookCreate,
    GuildUpdate,
}

impl EventKind {
    pub const ALL: [Self; 11] = [
        Self::ChannelCreate,
        Self::ChannelDelete,
        Self::ChannelUpdate,
        Self::RoleCreate,
        Self::RoleDelete,
        Self::RoleUpdate,
        Self::MemberBan,
        Self::MemberKick,
        Self::BotAdd,
        Self::WebhookCreate,
        Self::GuildUpdate,
    ];

    /// Platform audit-log action type recording this event
    #[must_use]
    pub const fn audit_action(self) -> u8 {
        match self {
            Self::GuildUpdate => 1,
            Self::ChannelCreate => 10,
            Self::ChannelUpdate => 11,
            Self::ChannelDelete => 12,
            Self::MemberKick => 20,
            Self::MemberBan => 22,
            Self::BotAdd => 28,
            Self::RoleCreate => 30,
            Self::RoleUpdate => 31,
            Self::RoleDelete => 32,
            Self::WebhookCreate => 50,
        }
    }

    /// Kinds punished on the second occurrence when unconfigured
    #[must_use]
    pub const fn is_dangerous(self) -> bool {
        matches!(
            self,
            Self::MemberBan
                | Self::MemberKick
                | Self::BotAdd
                | Self::WebhookCreate
                | Self::ChannelDelete
                | Self::RoleDelete
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChannelCreate => "channel_create",
            Self::ChannelDelete => "channel_delete",
            Self::ChannelUpdate => "channel_update",
            Self::RoleCreate => "role_create",
            Self::RoleDelete => "role_delete",
            Self::RoleUpdate => "role_update",
            Self::MemberBan => "member_ban",
            Self::MemberKick => "member_kick",
            Self::BotAdd => "bot_add",
            Self::WebhookCreate => "webhook_create",
            Self::GuildUpdate => "guild_update",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many events of one kind an actor may cause within a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub count: u32,
    pub window_secs: u64,
    #[serde(default = "default_punishment")]
    pub punishment: ActionKind,
}

const fn default_punishment() -> ActionKind {
    ActionKind::Ban
}

impl Limit {
    /// Fallback for kinds without a configured limit
    #[must_use]
    pub const fn default_for(kind: EventKind) -> Self {
        Self {
            count: if kind.is_dangerous() { 1 } else { 3 },
            window_secs: 10,
            punishment: ActionKind::Ban,
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Anti-nuke settings of one guild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildPolicy {
    pub enabled: bool,
    /// Every monitored action by a non-exempt actor is a ban
    pub panic_mode: bool,
    pub whitelist_users: HashSet<u64>,
    pub whitelist_roles: HashSet<u64>,
    pub limits: HashMap<EventKind, Limit>,
    /// Channel receiving enforcement reports
    pub log_channel: Option<u64>,
}

impl GuildPolicy {
    #[must_use]
    pub fn limit(&self, kind: EventKind) -> Limit {
        self.limits
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Limit::default_for(kind))
    }

    /// Change the count and window for `kind`, keeping its punishment
    pub fn set_limit(&mut self, kind: EventKind, count: u32, window_secs: u64) -> Limit {
        let mut limit = self.limit(kind);
        limit.count = count.max(1);
        limit.window_secs = window_secs.max(1);
        self.limits.insert(kind, limit);
        limit
    }

    /// Change the punishment for `kind`, keeping its count and window
    pub fn set_punishment(&mut self, kind: EventKind, punishment: ActionKind) -> Limit {
        let mut limit = self.limit(kind);
        limit.punishment = punishment;
        self.limits.insert(kind, limit);
        limit
    }

    fn exempts(&self, actor_id: u64, actor_roles: &[u64]) -> bool {
        self.whitelist_users.contains(&actor_id)
            || actor_roles.iter().any(|role| self.whitelist_roles.contains(role))
    }
}

/// An administrative event with its responsible actor resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub guild_id: u64,
    pub kind: EventKind,
    pub actor_id: u64,
    /// From the cached guild profile when known
    pub owner_id: Option<u64>,
    pub actor_roles: Vec<u64>,
}

/// A punishment the policy asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub punishment: ActionKind,
    /// Events seen in the window, including this one
    pub count: usize,
    pub limit: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WindowKey {
    guild_id: u64,
    kind: EventKind,
    user_id: u64,
}

/// Per-guild policy plus sliding-window counters keyed `g:kind:u`
pub struct Detector {
    bot_id: u64,
    policies: DashMap<u64, GuildPolicy>,
    windows: DashMap<WindowKey, VecDeque<Instant>>,
}

impl Detector {
    #[must_use]
    pub fn new(bot_id: u64, policies: HashMap<u64, GuildPolicy>) -> Self {
        Self {
            bot_id,
            policies: policies.into_iter().collect(),
            windows: DashMap::new(),
        }
    }

    #[must_use]
    pub fn policy(&self, guild_id: u64) -> Option<GuildPolicy> {
        self.policies.get(&guild_id).map(|p| p.value().clone())
    }

    /// Whether events in the guild are judged at all
    #[must_use]
    pub fn is_enabled(&self, guild_id: u64) -> bool {
        self.policies.get(&guild_id).is_some_and(|p| p.enabled)
    }

    #[must_use]
    pub fn log_channel(&self, guild_id: u64) -> Option<u64> {
        self.policies.get(&guild_id).and_then(|p| p.log_channel)
    }

    /// Number of guilds with a policy
    #[must_use]
    pub fn guild_count(&self) -> usize {
        self.policies.len()
    }

    /// Replace a guild's policy; its open windows start over
    pub fn set_policy(&self, guild_id: u64, policy: GuildPolicy) {
        self.policies.insert(guild_id, policy);
        self.reset_guild(guild_id);
    }

    /// Edit a guild's policy in place, starting from the default when the
    /// guild has none
    pub fn update_policy<R>(&self, guild_id: u64, edit: impl FnOnce(&mut GuildPolicy) -> R) -> R {
        let mut policy = self.policies.entry(guild_id).or_default();
        edit(policy.value_mut())
    }

    /// Number of live windows, for stats
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Judge an event observed now.
    #[must_use]
    pub fn evaluate(&self, observation: &Observation) -> Option<Verdict> {
        self.evaluate_at(observation, Instant::now())
    }

    /// Judge an event observed at `now`
    #[must_use]
    pub fn evaluate_at(&self, observation: &Observation, now: Instant) -> Option<Verdict> {
        let actor = observation.actor_id;
        if actor == 0 || actor == self.bot_id || Some(actor) == observation.owner_id {
            return None;
        }

        let policy = self.policies.get(&observation.guild_id)?;
        if !policy.enabled || policy.exempts(actor, &observation.actor_roles) {
            return None;
        }

        if policy.panic_mode {
            return Some(Verdict {
                punishment: ActionKind::Ban,
                count: 1,
                limit: 0,
                reason: format!("Anti-nuke: panic mode ({})", observation.kind),
            });
        }

        let limit = policy.limit(observation.kind);
        drop(policy);

        let count = self.record(
            WindowKey {
                guild_id: observation.guild_id,
                kind: observation.kind,
                user_id: actor,
            },
            limit.window(),
            now,
        );
        if count <= limit.count as usize {
            return None;
        }

        Some(Verdict {
            punishment: limit.punishment,
            count,
            limit: limit.count,
            reason: format!(
                "Anti-nuke: {} limit exceeded ({count}/{} in {}s)",
                observation.kind, limit.count, limit.window_secs
            ),
        })
    }

    /// Append `now` and return how many events fall inside the window
    fn record(&self, key: WindowKey, window: Duration, now: Instant) -> usize {
        let mut events = self.windows.entry(key).or_default();
        while let Some(&oldest) = events.front() {
            if now.saturating_duration_since(oldest) < window {
                break;
            }
            events.pop_front();
        }
        if events.len() == WINDOW_CAPACITY {
            events.pop_front();
        }
        events.push_back(now);
        events.len()
    }

    /// Drop every window of a guild
    pub fn reset_guild(&self, guild_id: u64) {
        self.windows.retain(|key, _| key.guild_id != guild_id);
    }
}
