//! Endpoint construction into leased buffers

use crate::snowflake;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

const BANS: &str = "/bans/";
const MEMBERS: &str = "/members/";
const BAN_QUERY: &str = "?delete_message_seconds=0";

/// Pre-computed URL segments for the member endpoints
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
    /// `{base}/guilds/`
    guilds_prefix: String,
}

impl Endpoints {
    #[must_use]
    pub fn new(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        let mut guilds_prefix = String::with_capacity(base.len() + 8);
        guilds_prefix.push_str(&base);
        guilds_prefix.push_str("/guilds/");
        Self {
            base,
            guilds_prefix,
        }
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    fn guild(&self, buf: &mut String, guild_id: u64) {
        buf.clear();
        buf.push_str(&self.guilds_prefix);
        snowflake::push_decimal(buf, guild_id);
    }

    /// `{base}/guilds/{g}/bans/{u}?delete_message_seconds=0`
    pub fn ban(&self, buf: &mut String, guild_id: u64, user_id: u64) {
        self.guild(buf, guild_id);
        buf.push_str(BANS);
        snowflake::push_decimal(buf, user_id);
        buf.push_str(BAN_QUERY);
    }

    /// `{base}/guilds/{g}/members/{u}`
    pub fn member(&self, buf: &mut String, guild_id: u64, user_id: u64) {
        self.guild(buf, guild_id);
        buf.push_str(MEMBERS);
        snowflake::push_decimal(buf, user_id);
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_url() {
        let endpoints = Endpoints::default();
        let mut buf = String::from("stale contents");
        endpoints.ban(&mut buf, 123, 456);
        assert_eq!(
            buf,
            "https://discord.com/api/v10/guilds/123/bans/456?delete_message_seconds=0"
        );
    }

    #[test]
    fn test_member_url_custom_base() {
        let endpoints = Endpoints::new("http://127.0.0.1:8080/api/");
        let mut buf = String::new();
        endpoints.member(&mut buf, 7, 0);
        assert_eq!(buf, "http://127.0.0.1:8080/api/guilds/7/members/0");
    }
}
