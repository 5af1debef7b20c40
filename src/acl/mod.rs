//! Authorization of punishments against cached guild state

mod action;
mod permission;
mod platform;
mod profile;

pub use action::{ADMINISTRATOR, ActionKind};
pub use permission::{
    Decision, DenyReason, MAX_DECISION_TTL, PermissionCache, PermissionConfig, PermissionStats,
    bot_member_key, decision_key, evaluate, guild_key, member_key,
};
#[cfg(test)]
pub use platform::MockPlatform;
pub use platform::{AuditEntry, Platform, PlatformError, SerenityPlatform};
pub use profile::{GuildProfile, MemberProfile, RoleInfo};

#[cfg(test)]
pub(crate) use profile::fixtures;
