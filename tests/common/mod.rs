#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{delete, put};
use nuke_warden::acl::{AuditEntry, GuildProfile, Platform, PlatformError, RoleInfo};
use nuke_warden::config::KvBackend;
use nuke_warden::punish::DispatcherConfig;
use nuke_warden::{Core, CoreBuilder, CoreConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const GUILD: u64 = 1000;
pub const OWNER: u64 = 1;
pub const BOT: u64 = 2;
pub const TOKEN: &str = "test-token";

pub const ROLE_BOT: u64 = 100;
pub const ROLE_ADMIN: u64 = 101;
pub const ROLE_MOD: u64 = 102;
pub const ROLE_MEMBER: u64 = 103;
pub const ROLE_TOP: u64 = 104;
pub const ROLE_PEER: u64 = 105;

pub const MEMBER: u64 = 50;
pub const ADMIN: u64 = 51;
pub const ABOVE_BOT: u64 = 52;
pub const PEER: u64 = 53;

/// Platform double with a fixed guild and a fetch counter
pub struct FakePlatform {
    guild: GuildProfile,
    members: HashMap<u64, Vec<u64>>,
    pub fetches: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        let role_table = HashMap::from([
            (ROLE_BOT, RoleInfo { position: 10, permissions: 0x4 | 0x2 | 0x1000_0000 | 0x100_0000_0000 }),
            (ROLE_ADMIN, RoleInfo { position: 3, permissions: 0x8 }),
            (ROLE_MOD, RoleInfo { position: 5, permissions: 0x2 }),
            (ROLE_MEMBER, RoleInfo { position: 1, permissions: 0 }),
            (ROLE_TOP, RoleInfo { position: 20, permissions: 0 }),
            (ROLE_PEER, RoleInfo { position: 10, permissions: 0 }),
        ]);
        Self {
            guild: GuildProfile {
                guild_id: GUILD,
                owner_id: OWNER,
                role_table,
            },
            members: HashMap::from([
                (OWNER, vec![]),
                (BOT, vec![ROLE_BOT]),
                (MEMBER, vec![ROLE_MEMBER]),
                (ADMIN, vec![ROLE_MEMBER, ROLE_ADMIN]),
                (ABOVE_BOT, vec![ROLE_TOP]),
                (PEER, vec![ROLE_PEER]),
            ]),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn fetch_guild(&self, guild_id: u64) -> Result<GuildProfile, PlatformError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if guild_id == GUILD {
            Ok(self.guild.clone())
        } else {
            Err(PlatformError::Request("unknown guild".into()))
        }
    }

    async fn fetch_member_roles(&self, _guild_id: u64, user_id: u64) -> Result<Vec<u64>, PlatformError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.members
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PlatformError::Request("unknown member".into()))
    }

    async fn fetch_audit_entries(
        &self,
        _guild_id: u64,
        _action_code: u8,
        _limit: u8,
    ) -> Result<Vec<AuditEntry>, PlatformError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// One request seen by the fake API
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: &'static str,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

#[derive(Clone, Default)]
pub struct Seen(pub Arc<Mutex<Vec<Captured>>>);

impl Seen {
    pub fn all(&self) -> Vec<Captured> {
        self.0.lock().clone()
    }

    fn push(&self, method: &'static str, uri: &Uri, headers: HeaderMap) -> StatusCode {
        self.0.lock().push(Captured {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
        });
        StatusCode::NO_CONTENT
    }
}

async fn on_ban(
    State(seen): State<Seen>,
    Path((_g, _u)): Path<(u64, u64)>,
    uri: Uri,
    headers: HeaderMap,
) -> StatusCode {
    seen.push("PUT", &uri, headers)
}

async fn on_kick(State(seen): State<Seen>, uri: Uri, headers: HeaderMap) -> StatusCode {
    seen.push("DELETE", &uri, headers)
}

async fn on_patch(State(seen): State<Seen>, uri: Uri, headers: HeaderMap) -> StatusCode {
    seen.push("PATCH", &uri, headers)
}

/// Serve a fake API on an ephemeral port, returning its base URL
pub async fn fake_api() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/guilds/:g/bans/:u", put(on_ban))
        .route("/guilds/:g/members/:u", delete(on_kick).patch(on_patch))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), seen)
}

pub fn config(api_base: &str, queue_capacity: usize, worker_count: usize) -> CoreConfig {
    CoreConfig {
        token: TOKEN.into(),
        kv_backend: KvBackend::Memory,
        dispatcher: DispatcherConfig {
            api_base: api_base.into(),
            queue_capacity,
            worker_count,
            ..DispatcherConfig::default()
        },
        ..CoreConfig::default()
    }
}

pub async fn core_with(platform: Arc<FakePlatform>, config: CoreConfig) -> Core {
    CoreBuilder::new(config, BOT)
        .platform(platform)
        .build()
        .await
        .unwrap()
}

/// Poll until `done` holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(done: F) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}
