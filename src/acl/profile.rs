//! Cached guild and member views used to authorize punishments

use super::action::{ADMINISTRATOR, ActionKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub position: u16,
    pub permissions: u64,
}

/// Owner and role table of a guild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildProfile {
    pub guild_id: u64,
    pub owner_id: u64,
    pub role_table: HashMap<u64, RoleInfo>,
}

/// A member's roles with the fields derived from the guild's role table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub user_id: u64,
    /// In platform order
    pub roles: Vec<u64>,
    /// 0 when the member has no known roles
    pub highest_role_position: u16,
    pub has_admin: bool,
    /// Unix seconds
    pub cached_at: i64,
}

impl GuildProfile {
    /// Join a member's role ids against the role table. Unknown roles
    /// contribute neither position nor permissions.
    #[must_use]
    pub fn build_member(&self, user_id: u64, roles: Vec<u64>) -> MemberProfile {
        let (highest_role_position, has_admin) = self.rank(&roles);
        MemberProfile {
            user_id,
            roles,
            highest_role_position,
            has_admin,
            cached_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Recompute a cached member's derived fields against this role table
    #[must_use]
    pub fn rederive(&self, mut member: MemberProfile) -> MemberProfile {
        let (highest_role_position, has_admin) = self.rank(&member.roles);
        member.highest_role_position = highest_role_position;
        member.has_admin = has_admin;
        member
    }

    fn rank(&self, roles: &[u64]) -> (u16, bool) {
        roles
            .iter()
            .filter_map(|id| self.role_table.get(id))
            .fold((0u16, false), |(pos, admin), role| {
                (
                    pos.max(role.position),
                    admin || role.permissions & ADMINISTRATOR != 0,
                )
            })
    }

    /// Union of the permission bits granted by `member`'s roles
    #[must_use]
    pub fn permissions_of(&self, member: &MemberProfile) -> u64 {
        member
            .roles
            .iter()
            .filter_map(|id| self.role_table.get(id))
            .fold(0, |acc, role| acc | role.permissions)
    }

    /// Whether `member` may perform `action`, either through Administrator
    /// or the action's own bit
    #[must_use]
    pub fn has_permission(&self, member: &MemberProfile, action: ActionKind) -> bool {
        if member.has_admin {
            return true;
        }
        let granted = self.permissions_of(member);
        granted & ADMINISTRATOR != 0 || granted & action.required_permission() != 0
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_build_member_derives_fields() {
        let guild = guild();
        let member = guild.build_member(50, vec![ROLE_MEMBER, ROLE_MOD]);
        assert_eq!(member.highest_role_position, 5);
        assert!(!member.has_admin);
        assert_eq!(member.roles, vec![ROLE_MEMBER, ROLE_MOD]);

        let admin = guild.build_member(51, vec![ROLE_ADMIN]);
        assert!(admin.has_admin);
    }

    #[test]
    fn test_unknown_roles_contribute_nothing() {
        let guild = guild();
        let member = guild.build_member(50, vec![999, 998]);
        assert_eq!(member.highest_role_position, 0);
        assert!(!member.has_admin);
        assert_eq!(guild.permissions_of(&member), 0);

        let no_roles = guild.build_member(52, Vec::new());
        assert_eq!(no_roles.highest_role_position, 0);
    }

    #[test]
    fn test_rederive_follows_role_table() {
        let mut guild = guild();
        let member = guild.build_member(50, vec![ROLE_MEMBER]);
        let cached_at = member.cached_at;

        if let Some(role) = guild.role_table.get_mut(&ROLE_MEMBER) {
            role.permissions = ADMINISTRATOR;
            role.position = 15;
        }
        let member = guild.rederive(member);
        assert!(member.has_admin);
        assert_eq!(member.highest_role_position, 15);
        assert_eq!(member.cached_at, cached_at);
    }

    #[test]
    fn test_has_permission() {
        let guild = guild();
        let bot = guild.build_member(BOT, vec![ROLE_BOT]);
        for action in ActionKind::ALL {
            assert!(guild.has_permission(&bot, action));
        }

        let moderator = guild.build_member(60, vec![ROLE_MOD]);
        assert!(guild.has_permission(&moderator, ActionKind::Kick));
        assert!(!guild.has_permission(&moderator, ActionKind::Ban));

        let admin = guild.build_member(61, vec![ROLE_ADMIN]);
        assert!(guild.has_permission(&admin, ActionKind::Quarantine));
    }
}
