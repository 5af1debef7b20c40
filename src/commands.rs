use crate::acl::ActionKind;
use crate::detector::{EventKind, GuildPolicy};
use crate::pools::EmbedDraft;
use crate::{COMMAND_TARGET, Context, CoreStats, Error};
use poise::serenity_prelude as serenity;
use poise::{ChoiceParameter, CreateReply, command};
use std::fmt::Write as _;
use tracing::info;

const STATS_COLOR: u32 = 0x0034_98db;
const SETTINGS_COLOR: u32 = 0x002e_cc71;

/// Basic ping command
/// This command is used to check if the bot is responsive.
#[command(prefix_command, slash_command, guild_only)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say("Pong!").await?;
    Ok(())
}

/// Show enforcement, cache and audit-log counters
#[command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn antinuke_stats(ctx: Context<'_>) -> Result<(), Error> {
    let core = ctx.data();
    let stats = core.stats();

    let embed = {
        let mut draft = core.pools().embeds.get();
        let mut scratch = core.pools().strings.get();
        render_stats(&stats, &mut draft, &mut scratch);
        draft.to_embed()
    };

    ctx.send(CreateReply::default().embed(embed)).await?;
    Ok(())
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

/// Fill `draft` with the stats embed; `scratch` is a reusable buffer
pub fn render_stats(stats: &CoreStats, draft: &mut EmbedDraft, scratch: &mut String) {
    draft.title.push_str("Anti-nuke stats");
    draft.color = STATS_COLOR;

    let dispatch = &stats.dispatch;
    let _ = write!(
        scratch,
        "{} submitted\n{} bans / {} total\n{} errors, {} dropped",
        dispatch.submitted,
        dispatch.bans_completed,
        dispatch.completed,
        dispatch.errors,
        dispatch.queue_dropped
    );
    draft.field("Punishments", scratch.as_str(), true);
    scratch.clear();

    let _ = write!(
        scratch,
        "{} queued\nmean API {}ms",
        dispatch.queued,
        dispatch.mean_api_latency.as_millis()
    );
    draft.field("Queue", scratch.as_str(), true);
    scratch.clear();

    let permissions = &stats.permissions;
    let _ = write!(
        scratch,
        "{} hits / {} misses\n{} cached",
        permissions.hits, permissions.misses, permissions.cached_decisions
    );
    draft.field("Decisions", scratch.as_str(), true);
    scratch.clear();

    let _ = write!(
        scratch,
        "guilds {} L1 / {} overall\nmembers {} L1 / {} overall",
        percent(stats.guild_profiles.l1_hit_rate()),
        percent(stats.guild_profiles.overall_hit_rate()),
        percent(stats.member_profiles.l1_hit_rate()),
        percent(stats.member_profiles.overall_hit_rate())
    );
    draft.field("Profile caches", scratch.as_str(), false);
    scratch.clear();

    let audit = &stats.audit;
    let _ = write!(
        scratch,
        "{} fetches ({} failed)\n{} hits / {} misses",
        audit.fetches, audit.fetch_errors, audit.hits, audit.misses
    );
    draft.field("Audit log", scratch.as_str(), true);
    scratch.clear();

    let _ = write!(
        scratch,
        "{} guild policies, {} live windows",
        stats.guild_policies, stats.detection_windows
    );
    draft.field("Detection", scratch.as_str(), true);
    scratch.clear();

    let _ = write!(draft.footer, "Uptime {}s", stats.uptime.as_secs());
}

/// Event kinds selectable in settings commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ChoiceParameter)]
pub enum ActionChoice {
    #[name = "Ban Members"]
    MemberBan,
    #[name = "Kick Members"]
    MemberKick,
    #[name = "Channel Create"]
    ChannelCreate,
    #[name = "Channel Delete"]
    ChannelDelete,
    #[name = "Channel Update"]
    ChannelUpdate,
    #[name = "Role Create"]
    RoleCreate,
    #[name = "Role Delete"]
    RoleDelete,
    #[name = "Role Update"]
    RoleUpdate,
    #[name = "Bot Add"]
    BotAdd,
    #[name = "Webhook Create"]
    WebhookCreate,
    #[name = "Guild Update"]
    GuildUpdate,
    #[name = "All Actions"]
    All,
}

impl ActionChoice {
    #[must_use]
    pub fn kinds(self) -> &'static [EventKind] {
        match self {
            Self::MemberBan => &[EventKind::MemberBan],
            Self::MemberKick => &[EventKind::MemberKick],
            Self::ChannelCreate => &[EventKind::ChannelCreate],
            Self::ChannelDelete => &[EventKind::ChannelDelete],
            Self::ChannelUpdate => &[EventKind::ChannelUpdate],
            Self::RoleCreate => &[EventKind::RoleCreate],
            Self::RoleDelete => &[EventKind::RoleDelete],
            Self::RoleUpdate => &[EventKind::RoleUpdate],
            Self::BotAdd => &[EventKind::BotAdd],
            Self::WebhookCreate => &[EventKind::WebhookCreate],
            Self::GuildUpdate => &[EventKind::GuildUpdate],
            Self::All => &EventKind::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ChoiceParameter)]
pub enum PunishmentChoice {
    Ban,
    Kick,
    Timeout,
    #[name = "Quarantine (remove roles)"]
    Quarantine,
}

impl From<PunishmentChoice> for ActionKind {
    fn from(choice: PunishmentChoice) -> Self {
        match choice {
            PunishmentChoice::Ban => Self::Ban,
            PunishmentChoice::Kick => Self::Kick,
            PunishmentChoice::Timeout => Self::Timeout,
            PunishmentChoice::Quarantine => Self::Quarantine,
        }
    }
}

/// Whitelist change requested by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistEntry {
    User(u64),
    Role(u64),
}

impl WhitelistEntry {
    /// Add to or remove from `policy`; false when nothing changed
    pub fn apply(self, policy: &mut GuildPolicy, add: bool) -> bool {
        let set = match self {
            Self::User(_) => &mut policy.whitelist_users,
            Self::Role(_) => &mut policy.whitelist_roles,
        };
        let id = match self {
            Self::User(id) | Self::Role(id) => id,
        };
        if add { set.insert(id) } else { set.remove(&id) }
    }

    fn mention(self, out: &mut String) {
        let _ = match self {
            Self::User(id) => write!(out, "<@{id}>"),
            Self::Role(id) => write!(out, "<@&{id}>"),
        };
    }
}

fn guild_of(ctx: Context<'_>) -> Result<u64, Error> {
    Ok(ctx.guild_id().ok_or("command is guild only")?.get())
}

/// Render an embed from pooled buffers and send it
async fn reply(
    ctx: Context<'_>,
    render: impl FnOnce(&mut EmbedDraft, &mut String),
) -> Result<(), Error> {
    let embed = {
        let pools = ctx.data().pools();
        let mut draft = pools.embeds.get();
        let mut scratch = pools.strings.get();
        render(&mut draft, &mut scratch);
        draft.to_embed()
    };
    ctx.send(CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Configure the anti-nuke protection of this server
#[command(
    slash_command,
    prefix_command,
    guild_only,
    default_member_permissions = "ADMINISTRATOR",
    subcommands(
        "enable",
        "disable",
        "status",
        "setlimit",
        "punishment",
        "whitelist",
        "panic",
        "logs"
    ),
    subcommand_required
)]
pub async fn antinuke(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Start judging administrative events in this server
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn enable(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    ctx.data()
        .detector()
        .update_policy(guild_id, |policy| policy.enabled = true);
    ctx.data().permissions().prewarm(guild_id);
    info!(target: COMMAND_TARGET, guild_id, "Anti-nuke enabled");
    reply(ctx, |draft, _| {
        draft.title.push_str("Anti-nuke enabled");
        draft.color = SETTINGS_COLOR;
    })
    .await
}

/// Stop judging administrative events in this server
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn disable(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    ctx.data()
        .detector()
        .update_policy(guild_id, |policy| policy.enabled = false);
    info!(target: COMMAND_TARGET, guild_id, "Anti-nuke disabled");
    reply(ctx, |draft, _| {
        draft.title.push_str("Anti-nuke disabled");
        draft.color = SETTINGS_COLOR;
    })
    .await
}

/// Show the current anti-nuke settings
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let policy = ctx
        .data()
        .detector()
        .policy(guild_of(ctx)?)
        .unwrap_or_default();
    reply(ctx, |draft, scratch| render_status(&policy, draft, scratch)).await
}

/// Set how many actions of a kind one member may take within a window
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn setlimit(
    ctx: Context<'_>,
    #[description = "Action to limit"] action: ActionChoice,
    #[description = "Actions allowed in the window"]
    #[min = 1]
    #[max = 100]
    limit: u32,
    #[description = "Window length in seconds (default 10)"]
    #[min = 1]
    #[max = 3600]
    seconds: Option<u64>,
) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    let seconds = seconds.unwrap_or(10);
    ctx.data().detector().update_policy(guild_id, |policy| {
        for &kind in action.kinds() {
            policy.set_limit(kind, limit, seconds);
        }
    });
    info!(target: COMMAND_TARGET, guild_id, ?action, limit, seconds, "Limit updated");
    reply(ctx, |draft, scratch| {
        draft.title.push_str("Limit updated");
        draft.color = SETTINGS_COLOR;
        draft.field("Action", action.name(), true);
        let _ = write!(scratch, "{limit} in {seconds}s");
        draft.field("Limit", scratch.as_str(), true);
    })
    .await
}

/// Set what happens to a member who exceeds a limit
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn punishment(
    ctx: Context<'_>,
    #[description = "Action to configure"] action: ActionChoice,
    #[description = "Punishment to apply"] punishment: PunishmentChoice,
) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    let kind = ActionKind::from(punishment);
    ctx.data().detector().update_policy(guild_id, |policy| {
        for &event in action.kinds() {
            policy.set_punishment(event, kind);
        }
    });
    info!(target: COMMAND_TARGET, guild_id, ?action, punishment = %kind, "Punishment updated");
    reply(ctx, |draft, _| {
        draft.title.push_str("Punishment updated");
        draft.color = SETTINGS_COLOR;
        draft.field("Action", action.name(), true);
        draft.field("Punishment", kind.as_str(), true);
    })
    .await
}

/// Manage users and roles the anti-nuke never punishes
#[command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("whitelist_add", "whitelist_remove", "whitelist_list"),
    subcommand_required
)]
pub async fn whitelist(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn change_whitelist(
    ctx: Context<'_>,
    user: Option<serenity::User>,
    role: Option<serenity::Role>,
    add: bool,
) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    let entries: Vec<WhitelistEntry> = user
        .map(|u| WhitelistEntry::User(u.id.get()))
        .into_iter()
        .chain(role.map(|r| WhitelistEntry::Role(r.id.get())))
        .collect();
    if entries.is_empty() {
        ctx.say("Give a user, a role or both.").await?;
        return Ok(());
    }

    let changed: Vec<(WhitelistEntry, bool)> =
        ctx.data().detector().update_policy(guild_id, |policy| {
            entries
                .iter()
                .map(|&entry| (entry, entry.apply(policy, add)))
                .collect()
        });
    info!(target: COMMAND_TARGET, guild_id, add, ?changed, "Whitelist updated");

    reply(ctx, |draft, scratch| {
        draft
            .title
            .push_str(if add { "Whitelist add" } else { "Whitelist remove" });
        draft.color = SETTINGS_COLOR;
        for (entry, done) in changed {
            entry.mention(scratch);
            scratch.push_str(match (add, done) {
                (true, true) => " added\n",
                (true, false) => " was already whitelisted\n",
                (false, true) => " removed\n",
                (false, false) => " was not whitelisted\n",
            });
        }
        draft.description.push_str(scratch);
    })
    .await
}

/// Whitelist a user or role
#[command(
    slash_command,
    prefix_command,
    guild_only,
    rename = "add",
    required_permissions = "ADMINISTRATOR"
)]
pub async fn whitelist_add(
    ctx: Context<'_>,
    #[description = "User to trust"] user: Option<serenity::User>,
    #[description = "Role to trust"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    change_whitelist(ctx, user, role, true).await
}

/// Remove a user or role from the whitelist
#[command(
    slash_command,
    prefix_command,
    guild_only,
    rename = "remove",
    required_permissions = "ADMINISTRATOR"
)]
pub async fn whitelist_remove(
    ctx: Context<'_>,
    #[description = "User to remove"] user: Option<serenity::User>,
    #[description = "Role to remove"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    change_whitelist(ctx, user, role, false).await
}

/// List whitelisted users and roles
#[command(
    slash_command,
    prefix_command,
    guild_only,
    rename = "list",
    required_permissions = "ADMINISTRATOR"
)]
pub async fn whitelist_list(ctx: Context<'_>) -> Result<(), Error> {
    let policy = ctx
        .data()
        .detector()
        .policy(guild_of(ctx)?)
        .unwrap_or_default();
    reply(ctx, |draft, scratch| render_whitelist(&policy, draft, scratch)).await
}

/// Toggle panic mode: every monitored action by a non-exempt member is a ban
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn panic(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    let on = ctx.data().detector().update_policy(guild_id, |policy| {
        policy.panic_mode = !policy.panic_mode;
        policy.panic_mode
    });
    info!(target: COMMAND_TARGET, guild_id, panic_mode = on, "Panic mode toggled");
    reply(ctx, |draft, _| {
        draft
            .title
            .push_str(if on { "Panic mode on" } else { "Panic mode off" });
        draft.color = if on { 0x00e7_4c3c } else { SETTINGS_COLOR };
    })
    .await
}

/// Set or clear the channel receiving enforcement reports
#[command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn logs(
    ctx: Context<'_>,
    #[description = "Report channel, omit to stop reports"]
    #[channel_types("Text")]
    channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = guild_of(ctx)?;
    let channel_id = channel.map(|c| c.id.get());
    ctx.data()
        .detector()
        .update_policy(guild_id, |policy| policy.log_channel = channel_id);
    info!(target: COMMAND_TARGET, guild_id, ?channel_id, "Log channel updated");
    reply(ctx, |draft, scratch| {
        draft.title.push_str("Log channel updated");
        draft.color = SETTINGS_COLOR;
        match channel_id {
            Some(id) => {
                let _ = write!(scratch, "Reports go to <#{id}>");
            }
            None => scratch.push_str("Reports are off"),
        }
        draft.description.push_str(scratch);
    })
    .await
}

/// Fill `draft` with a guild's policy
pub fn render_status(policy: &GuildPolicy, draft: &mut EmbedDraft, scratch: &mut String) {
    draft.title.push_str("Anti-nuke status");
    draft.color = SETTINGS_COLOR;
    draft.field("Enabled", if policy.enabled { "yes" } else { "no" }, true);
    draft.field("Panic mode", if policy.panic_mode { "on" } else { "off" }, true);
    match policy.log_channel {
        Some(id) => {
            let _ = write!(scratch, "<#{id}>");
        }
        None => scratch.push_str("none"),
    }
    draft.field("Log channel", scratch.as_str(), true);
    scratch.clear();

    let _ = write!(
        scratch,
        "{} users, {} roles",
        policy.whitelist_users.len(),
        policy.whitelist_roles.len()
    );
    draft.field("Whitelist", scratch.as_str(), true);
    scratch.clear();

    for kind in EventKind::ALL {
        let limit = policy.limit(kind);
        let _ = writeln!(
            scratch,
            "`{kind}` {} in {}s, {}",
            limit.count, limit.window_secs, limit.punishment
        );
    }
    draft.field("Limits", scratch.as_str(), false);
    scratch.clear();
}

/// Fill `draft` with the whitelist, ids sorted
pub fn render_whitelist(policy: &GuildPolicy, draft: &mut EmbedDraft, scratch: &mut String) {
    draft.title.push_str("Whitelist");
    draft.color = SETTINGS_COLOR;

    let mut users: Vec<u64> = policy.whitelist_users.iter().copied().collect();
    let mut roles: Vec<u64> = policy.whitelist_roles.iter().copied().collect();
    users.sort_unstable();
    roles.sort_unstable();

    for (name, entries) in [
        ("Users", users.into_iter().map(WhitelistEntry::User).collect::<Vec<_>>()),
        ("Roles", roles.into_iter().map(WhitelistEntry::Role).collect()),
    ] {
        if entries.is_empty() {
            scratch.push_str("none");
        }
        for entry in entries {
            entry.mention(scratch);
            scratch.push('\n');
        }
        draft.field(name, scratch.trim_end(), true);
        scratch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStats;
    use crate::cache::CacheMetrics;
    use crate::punish::DispatchStats;
    use crate::acl::PermissionStats;
    use std::time::Duration;

    #[test]
    fn test_command_definitions() {
        let cmd = ping();
        assert_eq!(cmd.name, "ping");
        assert!(cmd.guild_only);

        let stats = antinuke_stats();
        assert_eq!(stats.name, "antinuke_stats");
        assert!(stats.create_as_slash_command().is_some());
        assert!(!stats.required_permissions.is_empty());
    }

    #[test]
    fn test_antinuke_command_tree() {
        let cmd = antinuke();
        assert_eq!(cmd.name, "antinuke");
        let names: Vec<&str> = cmd.subcommands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["enable", "disable", "status", "setlimit", "punishment", "whitelist", "panic", "logs"]
        );

        let whitelist = cmd
            .subcommands
            .iter()
            .find(|c| c.name == "whitelist")
            .unwrap();
        let names: Vec<&str> = whitelist.subcommands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["add", "remove", "list"]);
        assert!(cmd.create_as_slash_command().is_some());
    }

    #[test]
    fn test_action_choices_cover_every_kind() {
        assert_eq!(ActionChoice::All.kinds(), &EventKind::ALL);
        assert_eq!(ActionChoice::ChannelDelete.kinds(), &[EventKind::ChannelDelete]);
        assert_eq!(ActionChoice::MemberBan.name(), "Ban Members");
        assert_eq!(ActionKind::from(PunishmentChoice::Quarantine), ActionKind::Quarantine);
    }

    #[test]
    fn test_setlimit_for_all_actions() {
        let mut policy = GuildPolicy::default();
        policy.set_punishment(EventKind::RoleDelete, ActionKind::Kick);
        for &kind in ActionChoice::All.kinds() {
            policy.set_limit(kind, 4, 20);
        }
        assert!(EventKind::ALL.iter().all(|&k| policy.limit(k).count == 4));
        assert_eq!(policy.limit(EventKind::RoleDelete).punishment, ActionKind::Kick);
        assert_eq!(policy.limit(EventKind::BotAdd).punishment, ActionKind::Ban);
    }

    #[test]
    fn test_whitelist_entries() {
        let mut policy = GuildPolicy::default();
        assert!(WhitelistEntry::User(5).apply(&mut policy, true));
        assert!(!WhitelistEntry::User(5).apply(&mut policy, true));
        assert!(WhitelistEntry::Role(9).apply(&mut policy, true));
        assert!(policy.whitelist_users.contains(&5));
        assert!(policy.whitelist_roles.contains(&9));

        let mut draft = EmbedDraft::default();
        let mut scratch = String::new();
        render_whitelist(&policy, &mut draft, &mut scratch);
        assert_eq!(draft.fields[0].1, "<@5>");
        assert_eq!(draft.fields[1].1, "<@&9>");

        assert!(WhitelistEntry::Role(9).apply(&mut policy, false));
        assert!(!WhitelistEntry::Role(9).apply(&mut policy, false));
        assert!(policy.whitelist_roles.is_empty());
    }

    #[test]
    fn test_render_status() {
        let mut policy = GuildPolicy {
            enabled: true,
            log_channel: Some(77),
            ..GuildPolicy::default()
        };
        policy.set_limit(EventKind::ChannelDelete, 2, 30);

        let mut draft = EmbedDraft::default();
        let mut scratch = String::new();
        render_status(&policy, &mut draft, &mut scratch);

        assert_eq!(draft.fields[0].1, "yes");
        assert_eq!(draft.fields[2].1, "<#77>");
        let limits = &draft.fields[4].1;
        assert!(limits.contains("`channel_delete` 2 in 30s, BAN"));
        assert_eq!(limits.lines().count(), EventKind::ALL.len());
        assert!(scratch.is_empty());
    }

    #[test]
    fn test_render_stats() {
        let stats = CoreStats {
            dispatch: DispatchStats {
                submitted: 7,
                bans_completed: 3,
                completed: 5,
                errors: 1,
                queue_dropped: 1,
                queued: 0,
                mean_api_latency: Duration::from_millis(42),
            },
            guild_profiles: CacheMetrics {
                l1_hits: 3,
                l1_misses: 1,
                ..CacheMetrics::default()
            },
            member_profiles: CacheMetrics::default(),
            permissions: PermissionStats {
                hits: 10,
                misses: 2,
                cached_decisions: 4,
            },
            audit: AuditStats::default(),
            guild_policies: 2,
            detection_windows: 9,
            uptime: Duration::from_secs(3600),
        };

        let mut draft = EmbedDraft::default();
        let mut scratch = String::new();
        render_stats(&stats, &mut draft, &mut scratch);

        assert_eq!(draft.fields.len(), 6);
        assert_eq!(draft.fields[0].0, "Punishments");
        assert!(draft.fields[0].1.contains("3 bans / 5 total"));
        assert!(draft.fields[1].1.contains("mean API 42ms"));
        assert!(draft.fields[3].1.starts_with("guilds 75.0% L1"));
        assert_eq!(draft.footer, "Uptime 3600s");
        assert!(scratch.is_empty());
    }
}
