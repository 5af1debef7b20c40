use crate::detector::EventKind;
use crate::{AdminEvent, Core, EVENT_TARGET, Invalidation, Outcome};
use poise::serenity_prelude::{
    self as serenity, Cache, ChannelId, Context, EventHandler, Guild, GuildChannel, GuildId,
    GuildMemberUpdateEvent, Member, Message, PartialGuild, Ready, Role, RoleId, User, UserId,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Gateway glue: turns administrative events into engine calls and keeps
/// the permission cache in step with role and membership changes.
pub struct Handler {
    core: Core,
}

impl Handler {
    #[must_use]
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    async fn observe(&self, ctx: &Context, guild_id: GuildId, kind: EventKind, target_id: Option<u64>) {
        if let Some(invalidation) = invalidation_for(kind, guild_id.get(), target_id) {
            self.core.invalidate(invalidation).await;
        }
        let cache = Arc::clone(&ctx.cache);
        let event = AdminEvent {
            guild_id: guild_id.get(),
            kind,
            target_id,
        };
        let outcome = self
            .core
            .on_event(event, move |actor| roles_of(&cache, guild_id, actor))
            .await;

        match outcome {
            Outcome::Submitted(submitted) => info!(
                target: EVENT_TARGET,
                guild_id = event.guild_id,
                kind = %kind,
                ?submitted,
                "Punishment dispatched"
            ),
            Outcome::Denied(reason) => warn!(
                target: EVENT_TARGET,
                guild_id = event.guild_id,
                kind = %kind,
                reason = %reason,
                "Punishment refused"
            ),
            other => debug!(
                target: EVENT_TARGET,
                guild_id = event.guild_id,
                kind = %kind,
                outcome = ?other,
                "Event processed"
            ),
        }
    }
}

/// Permission state an administrative event makes stale
fn invalidation_for(kind: EventKind, guild_id: u64, target_id: Option<u64>) -> Option<Invalidation> {
    match kind {
        EventKind::RoleCreate
        | EventKind::RoleDelete
        | EventKind::RoleUpdate
        | EventKind::GuildUpdate => Some(Invalidation::Guild(guild_id)),
        EventKind::MemberBan | EventKind::MemberKick => {
            target_id.map(|user_id| Invalidation::Member { guild_id, user_id })
        }
        _ => None,
    }
}

/// Role ids of a member from the gateway cache, empty when not cached
fn roles_of(cache: &Cache, guild_id: GuildId, user_id: u64) -> Vec<u64> {
    if user_id == 0 {
        return Vec::new();
    }
    cache
        .member(guild_id, UserId::new(user_id))
        .map(|member| member.roles.iter().map(|role| role.get()).collect())
        .unwrap_or_default()
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!("Connected as {user_name}, shard {shard_id}");
    }

    /// Warm permissions for every guild once the cache is populated
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        for guild_id in &guilds {
            self.core.permissions().prewarm(guild_id.get());
        }
        info!("Cache ready! Warming permissions for {guild_count} guild(s)");
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new == Some(true) {
            self.core.permissions().prewarm(guild.id.get());
        }
    }

    async fn channel_create(&self, ctx: Context, channel: GuildChannel) {
        self.observe(&ctx, channel.guild_id, EventKind::ChannelCreate, Some(channel.id.get()))
            .await;
    }

    async fn channel_delete(&self, ctx: Context, channel: GuildChannel, _messages: Option<Vec<Message>>) {
        self.observe(&ctx, channel.guild_id, EventKind::ChannelDelete, Some(channel.id.get()))
            .await;
    }

    async fn channel_update(&self, ctx: Context, _old: Option<GuildChannel>, new: GuildChannel) {
        self.observe(&ctx, new.guild_id, EventKind::ChannelUpdate, Some(new.id.get()))
            .await;
    }

    async fn guild_role_create(&self, ctx: Context, new: Role) {
        self.observe(&ctx, new.guild_id, EventKind::RoleCreate, Some(new.id.get()))
            .await;
    }

    async fn guild_role_delete(
        &self,
        ctx: Context,
        guild_id: GuildId,
        removed_role_id: RoleId,
        _removed_role_data_if_available: Option<Role>,
    ) {
        self.observe(&ctx, guild_id, EventKind::RoleDelete, Some(removed_role_id.get()))
            .await;
    }

    async fn guild_role_update(&self, ctx: Context, _old_data_if_available: Option<Role>, new: Role) {
        self.observe(&ctx, new.guild_id, EventKind::RoleUpdate, Some(new.id.get()))
            .await;
    }

    async fn guild_update(
        &self,
        ctx: Context,
        _old_data_if_available: Option<Guild>,
        new_but_incomplete: PartialGuild,
    ) {
        let guild_id = new_but_incomplete.id;
        self.observe(&ctx, guild_id, EventKind::GuildUpdate, Some(guild_id.get()))
            .await;
    }

    async fn guild_ban_addition(&self, ctx: Context, guild_id: GuildId, banned_user: User) {
        self.observe(&ctx, guild_id, EventKind::MemberBan, Some(banned_user.id.get()))
            .await;
    }

    /// A removal is a kick only if the audit log says so
    async fn guild_member_removal(
        &self,
        ctx: Context,
        guild_id: GuildId,
        user: User,
        _member_data_if_available: Option<Member>,
    ) {
        self.observe(&ctx, guild_id, EventKind::MemberKick, Some(user.id.get()))
            .await;
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        if new_member.user.bot {
            self.observe(
                &ctx,
                new_member.guild_id,
                EventKind::BotAdd,
                Some(new_member.user.id.get()),
            )
            .await;
        }
    }

    async fn guild_member_update(
        &self,
        _ctx: Context,
        _old_if_available: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        self.core
            .invalidate(Invalidation::Member {
                guild_id: event.guild_id.get(),
                user_id: event.user.id.get(),
            })
            .await;
    }

    async fn webhook_update(&self, ctx: Context, guild_id: GuildId, _belongs_to_channel_id: ChannelId) {
        self.observe(&ctx, guild_id, EventKind::WebhookCreate, None).await;
    }
}
