use super::client::{ClientPool, header_template, request_headers};
use super::stats::{Counters, DispatchStats};
use super::url::Endpoints;
use super::{DispatcherConfig, PunishError, PunishTask};
use crate::PUNISH_TARGET;
use crate::acl::ActionKind;
use crate::pools::Pool;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const URL_BUFFERS: usize = 128;

/// What `submit` did with a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// BAN, running on its own task
    Spawned,
    Queued,
    /// Queue full; counted in `queue_dropped`
    Dropped,
    /// Dispatcher shut down
    Closed,
}

/// Outcome of one execution, forwarded to an optional reporter
#[derive(Debug, Clone, Serialize)]
pub struct PunishReport {
    pub task: PunishTask,
    /// API latency on success
    pub result: Result<Duration, String>,
}

#[derive(Serialize)]
struct TimeoutBody {
    communication_disabled_until: String,
}

#[derive(Serialize)]
struct RolesBody<'a> {
    roles: &'a [u64],
}

struct Inner {
    clients: ClientPool,
    endpoints: Endpoints,
    headers: HeaderMap,
    url_buffers: Pool<String>,
    counters: Counters,
    sender: mpsc::Sender<PunishTask>,
    receiver: Arc<Mutex<mpsc::Receiver<PunishTask>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    worker_count: usize,
    timeout_length: chrono::Duration,
    reporter: Option<mpsc::Sender<PunishReport>>,
}

/// Executes punishments through direct HTTPS calls.
///
/// Cheap to clone; clones share the queue, clients and counters.
#[derive(Clone)]
pub struct Dispatcher(Arc<Inner>);

fn new_url_buffer() -> String {
    String::with_capacity(128)
}

fn recycle_url_buffer(buf: &mut String) -> bool {
    buf.clear();
    true
}

impl Dispatcher {
    /// Build the dispatcher. Workers are not running until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns `PunishError` if the HTTP clients cannot be built or the token
    /// is not a valid header value.
    pub fn new(config: &DispatcherConfig, token: &str) -> Result<Self, PunishError> {
        Self::build(config, token, None)
    }

    /// Like [`Self::new`], forwarding every execution outcome to `reporter`.
    /// Reports are dropped when the reporter is full.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_reporter(
        config: &DispatcherConfig,
        token: &str,
        reporter: mpsc::Sender<PunishReport>,
    ) -> Result<Self, PunishError> {
        Self::build(config, token, Some(reporter))
    }

    fn build(
        config: &DispatcherConfig,
        token: &str,
        reporter: Option<mpsc::Sender<PunishReport>>,
    ) -> Result<Self, PunishError> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Ok(Self(Arc::new(Inner {
            clients: ClientPool::new(config)?,
            endpoints: Endpoints::new(&config.api_base),
            headers: header_template(token)?,
            url_buffers: Pool::new(URL_BUFFERS, new_url_buffer, recycle_url_buffer),
            counters: Counters::default(),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown,
            started: AtomicBool::new(false),
            worker_count: config.worker_count,
            timeout_length: chrono::Duration::minutes(config.timeout_minutes),
            reporter,
        })))
    }

    /// Spawn the worker pool. Calling it again does nothing.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let handles: Vec<_> = (0..self.0.worker_count)
            .map(|id| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.worker(id).await })
            })
            .collect();
        info!(
            target: PUNISH_TARGET,
            workers = handles.len(),
            "Punishment workers started"
        );
        handles
    }

    /// Stop the workers after their current task
    pub fn shutdown(&self) {
        self.0.shutdown.send_replace(true);
    }

    /// Open one connection per pooled client
    pub async fn warm_connections(&self) {
        let mut url = self.0.url_buffers.get();
        url.push_str(self.0.endpoints.base());
        url.push_str("/gateway");
        self.0.clients.warm(url.as_str()).await;
    }

    /// Hand a task over for execution. Never waits.
    pub fn submit(&self, task: PunishTask) -> Submitted {
        self.0.counters.submitted();

        if task.kind == ActionKind::Ban {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run(task).await });
            return Submitted::Spawned;
        }

        match self.0.sender.try_send(task) {
            Ok(()) => Submitted::Queued,
            Err(TrySendError::Full(task)) => {
                self.0.counters.dropped();
                warn!(
                    target: PUNISH_TARGET,
                    guild_id = task.guild_id,
                    user_id = task.user_id,
                    kind = %task.kind,
                    "Punishment queue full, task dropped"
                );
                Submitted::Dropped
            }
            Err(TrySendError::Closed(_)) => Submitted::Closed,
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        let queued = self.0.sender.max_capacity() - self.0.sender.capacity();
        self.0.counters.snapshot(queued)
    }

    async fn worker(&self, id: usize) {
        let mut shutdown = self.0.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let next = {
                let mut receiver = self.0.receiver.lock().await;
                tokio::select! {
                    task = receiver.recv() => task,
                    _ = shutdown.changed() => None,
                }
            };
            match next {
                Some(task) => self.run(task).await,
                None => break,
            }
        }
        debug!(target: PUNISH_TARGET, worker = id, "Punishment worker stopped");
    }

    /// Execute, count, log and report one task. Never fails.
    async fn run(&self, task: PunishTask) {
        let started = Instant::now();
        let result = self.execute(&task).await;
        let api_latency = started.elapsed();
        let total_latency = task.total_latency();

        let report = match result {
            Ok(()) => {
                self.0.counters.completed(task.kind, api_latency);
                info!(
                    target: PUNISH_TARGET,
                    task_id = %task.id,
                    guild_id = task.guild_id,
                    user_id = task.user_id,
                    kind = %task.kind,
                    api_latency_us = u64::try_from(api_latency.as_micros()).unwrap_or(u64::MAX),
                    total_latency_ms = u64::try_from(total_latency.as_millis()).unwrap_or(u64::MAX),
                    detection_us = u64::try_from(task.detection_duration.as_micros()).unwrap_or(u64::MAX),
                    "Punishment executed"
                );
                Ok(api_latency)
            }
            Err(e) => {
                self.0.counters.error();
                error!(
                    target: PUNISH_TARGET,
                    task_id = %task.id,
                    guild_id = task.guild_id,
                    user_id = task.user_id,
                    kind = %task.kind,
                    error = %e,
                    "Punishment failed"
                );
                Err(e.to_string())
            }
        };

        if let Some(reporter) = &self.0.reporter {
            let _ = reporter.try_send(PunishReport {
                task,
                result: report,
            });
        }
    }

    fn request(
        &self,
        method: Method,
        kind: ActionKind,
        guild_id: u64,
        user_id: u64,
        reason: &str,
    ) -> RequestBuilder {
        let mut url = self.0.url_buffers.get();
        match kind {
            ActionKind::Ban => self.0.endpoints.ban(&mut url, guild_id, user_id),
            ActionKind::Kick | ActionKind::Timeout | ActionKind::Quarantine => {
                self.0.endpoints.member(&mut url, guild_id, user_id);
            }
        }
        self.0
            .clients
            .pick()
            .request(method, url.as_str())
            .headers(request_headers(&self.0.headers, reason))
    }

    async fn execute(&self, task: &PunishTask) -> Result<(), PunishError> {
        let PunishTask {
            guild_id,
            user_id,
            kind,
            ref reason,
            ..
        } = *task;

        let request = match kind {
            ActionKind::Ban => self.request(Method::PUT, kind, guild_id, user_id, reason),
            ActionKind::Kick => self.request(Method::DELETE, kind, guild_id, user_id, reason),
            ActionKind::Timeout => {
                let until = chrono::Utc::now() + self.0.timeout_length;
                let body = serde_json::to_vec(&TimeoutBody {
                    communication_disabled_until: until.to_rfc3339(),
                })?;
                self.request(Method::PATCH, kind, guild_id, user_id, reason)
                    .body(body)
            }
            ActionKind::Quarantine => {
                let body = serde_json::to_vec(&RolesBody { roles: &[] })?;
                self.request(Method::PATCH, kind, guild_id, user_id, reason)
                    .body(body)
            }
        };

        let response = request.send().await?;
        let status = response.status();
        // Drain so the connection returns to the pool
        let _ = response.bytes().await;

        if status.is_success() {
            Ok(())
        } else {
            Err(PunishError::Status {
                status: status.as_u16(),
            })
        }
    }
}
