pub mod acl;
pub mod audit;
pub mod cache;
pub mod commands;
pub mod config;
pub mod detector;
pub mod engine;
pub mod handlers;
pub mod kv;
pub mod logging;
pub mod notify;
pub mod pools;
pub mod punish;
pub mod snowflake;

pub const BOT_NAME: &str = "nuke_warden";
pub const COMMAND_TARGET: &str = "nuke_warden::command";
pub const ERROR_TARGET: &str = "nuke_warden::error";
pub const EVENT_TARGET: &str = "nuke_warden::handlers";
pub const CONSOLE_TARGET: &str = "nuke_warden";
/// Enforcement records, also written to their own log file
pub const PUNISH_TARGET: &str = "nuke_warden::punish";
pub const CACHE_TARGET: &str = "nuke_warden::cache";
pub const ACL_TARGET: &str = "nuke_warden::acl";

pub use config::{ConfigError, CoreConfig};
pub use engine::{AdminEvent, Core, CoreBuilder, CoreError, CoreStats, Invalidation, Outcome};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Core, Error>;
