//! Punishment kinds and the permission bit each one needs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Administrator permission bit
pub const ADMINISTRATOR: u64 = 0x8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Ban,
    Kick,
    Timeout,
    Quarantine,
}

impl ActionKind {
    pub const ALL: [Self; 4] = [Self::Ban, Self::Kick, Self::Timeout, Self::Quarantine];

    /// Permission bit the bot must hold to perform this action
    #[must_use]
    pub const fn required_permission(self) -> u64 {
        match self {
            Self::Ban => 0x4,
            Self::Kick => 0x2,
            Self::Timeout => 0x100_0000_0000,
            Self::Quarantine => 0x1000_0000,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "BAN",
            Self::Kick => "KICK",
            Self::Timeout => "TIMEOUT",
            Self::Quarantine => "QUARANTINE",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
