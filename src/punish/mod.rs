//! Punishment execution against the platform API
//!
//! BAN is executed on its own task the moment it is submitted. Every other
//! kind goes through a bounded queue drained by a fixed worker pool, and is
//! dropped when the queue is full.

mod client;
mod dispatcher;
mod stats;
mod task;
mod url;

pub use client::{AUDIT_LOG_REASON, ClientPool, header_template, request_headers};
pub use dispatcher::{Dispatcher, PunishReport, Submitted};
pub use stats::DispatchStats;
pub use task::PunishTask;
pub use url::{DEFAULT_API_BASE, Endpoints};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PunishError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("platform returned status {status}")]
    Status { status: u16 },

    #[error("invalid {0} header value")]
    InvalidHeader(&'static str),

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// API root without trailing slash
    pub api_base: String,
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Independent keep-alive clients handed out round-robin
    pub client_count: usize,
    pub max_idle_per_host: usize,
    /// Caps `client_count * max_idle_per_host`
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub request_timeout_secs: u64,
    /// Length of a TIMEOUT punishment
    pub timeout_minutes: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            queue_capacity: 10_000,
            worker_count: 100,
            client_count: 2,
            max_idle_per_host: 50,
            max_connections: 100,
            idle_timeout_secs: 90,
            connect_timeout_secs: 5,
            keepalive_secs: 30,
            request_timeout_secs: 10,
            timeout_minutes: 5,
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Clients needed so idle connections never exceed `max_connections`
    #[must_use]
    pub fn effective_client_count(&self) -> usize {
        let per_client = self.max_idle_per_host.max(1);
        self.client_count
            .min(self.max_connections / per_client)
            .max(1)
    }
}
