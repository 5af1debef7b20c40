//! Read access to the chat platform used by the detailed validation path
//! and the audit-log source

use super::profile::{GuildProfile, RoleInfo};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serenity::all::{GuildId, Http, UserId, audit_log};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Snowflake 0 never names a real object
    #[error("invalid {0} id 0")]
    InvalidId(&'static str),

    #[error("platform request failed: {0}")]
    Request(String),
}

impl From<serenity::Error> for PlatformError {
    fn from(error: serenity::Error) -> Self {
        Self::Request(error.to_string())
    }
}

/// One audit-log entry, newest first when returned in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditEntry {
    pub action_code: u8,
    /// Who performed the action
    pub user_id: u64,
    pub target_id: Option<u64>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Owner and role table of a guild
    async fn fetch_guild(&self, guild_id: u64) -> Result<GuildProfile, PlatformError>;

    /// Role ids of a member in platform order
    async fn fetch_member_roles(&self, guild_id: u64, user_id: u64)
    -> Result<Vec<u64>, PlatformError>;

    /// Most recent audit-log entries of one action type
    async fn fetch_audit_entries(
        &self,
        guild_id: u64,
        action_code: u8,
        limit: u8,
    ) -> Result<Vec<AuditEntry>, PlatformError>;
}

/// [`Platform`] over serenity's HTTP client
#[derive(Clone)]
pub struct SerenityPlatform {
    http: Arc<Http>,
}

impl SerenityPlatform {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn guild_id(id: u64) -> Result<GuildId, PlatformError> {
    if id == 0 {
        return Err(PlatformError::InvalidId("guild"));
    }
    Ok(GuildId::new(id))
}

fn user_id(id: u64) -> Result<UserId, PlatformError> {
    if id == 0 {
        return Err(PlatformError::InvalidId("user"));
    }
    Ok(UserId::new(id))
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn fetch_guild(&self, id: u64) -> Result<GuildProfile, PlatformError> {
        let guild = guild_id(id)?.to_partial_guild(self.http.as_ref()).await?;
        let role_table = guild
            .roles
            .iter()
            .map(|(role_id, role)| {
                (
                    role_id.get(),
                    RoleInfo {
                        position: role.position,
                        permissions: role.permissions.bits(),
                    },
                )
            })
            .collect();

        Ok(GuildProfile {
            guild_id: id,
            owner_id: guild.owner_id.get(),
            role_table,
        })
    }

    async fn fetch_member_roles(&self, guild: u64, user: u64) -> Result<Vec<u64>, PlatformError> {
        let member = self.http.get_member(guild_id(guild)?, user_id(user)?).await?;
        Ok(member.roles.iter().map(|role| role.get()).collect())
    }

    async fn fetch_audit_entries(
        &self,
        guild: u64,
        action_code: u8,
        limit: u8,
    ) -> Result<Vec<AuditEntry>, PlatformError> {
        let logs = guild_id(guild)?
            .audit_logs(
                &self.http,
                Some(audit_log::Action::from_value(action_code)),
                None,
                None,
                Some(limit),
            )
            .await?;

        Ok(logs
            .entries
            .iter()
            .map(|entry| AuditEntry {
                action_code: entry.action.num(),
                user_id: entry.user_id.get(),
                target_id: entry.target_id.map(|id| id.get()),
            })
            .collect())
    }
}
