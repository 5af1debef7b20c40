//! Enforcement log channel: batches dispatcher reports into one embed per
//! guild

use crate::EVENT_TARGET;
use crate::detector::Detector;
use crate::pools::{EmbedDraft, Pools};
use crate::punish::PunishReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::all::{ChannelId, CreateMessage, Http};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lines per embed; the rest are summarized
pub const MAX_LINES: usize = 25;

const COLOR_ENFORCED: u32 = 0x00e7_4c3c;
const COLOR_FAILED: u32 = 0x00ff_a500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Capacity of the report channel between dispatcher and log
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval_ms: 100,
            queue_capacity: 5000,
        }
    }
}

impl NotifyConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Somewhere an embed can be posted
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn post(&self, channel_id: u64, embed: &EmbedDraft) -> Result<(), serenity::Error>;
}

pub struct HttpSink(pub Arc<Http>);

#[async_trait]
impl ChannelSink for HttpSink {
    async fn post(&self, channel_id: u64, embed: &EmbedDraft) -> Result<(), serenity::Error> {
        if channel_id == 0 {
            return Ok(());
        }
        ChannelId::new(channel_id)
            .send_message(&self.0, CreateMessage::new().embed(embed.to_embed()))
            .await?;
        Ok(())
    }
}

/// Write the embed for one guild's reports into `draft`
pub fn render(reports: &[&PunishReport], draft: &mut EmbedDraft) {
    draft.title.push_str("Anti-nuke enforcement");
    draft.color = if reports.iter().all(|r| r.result.is_ok()) {
        COLOR_ENFORCED
    } else {
        COLOR_FAILED
    };

    for report in reports.iter().take(MAX_LINES) {
        let task = &report.task;
        let detection_us = task.detection_duration.as_secs_f64() * 1_000_000.0;
        let _ = match &report.result {
            Ok(api) => writeln!(
                draft.description,
                "**{}** <@{}> | {} `[detection {detection_us:.2}µs, api {}ms]`",
                task.kind,
                task.user_id,
                task.reason,
                api.as_millis()
            ),
            Err(error) => writeln!(
                draft.description,
                "**{}** <@{}> failed: {error}",
                task.kind, task.user_id
            ),
        };
    }
    if reports.len() > MAX_LINES {
        let _ = write!(
            draft.description,
            "*...and {} more*",
            reports.len() - MAX_LINES
        );
    }
    let _ = write!(draft.footer, "{} events logged", reports.len());
}

/// Consumes dispatcher reports and posts them to each guild's log channel
pub struct EnforcementLog {
    detector: Arc<Detector>,
    pools: Arc<Pools>,
    sink: Arc<dyn ChannelSink>,
    config: NotifyConfig,
}

impl EnforcementLog {
    #[must_use]
    pub fn new(
        detector: Arc<Detector>,
        pools: Arc<Pools>,
        sink: Arc<dyn ChannelSink>,
        config: NotifyConfig,
    ) -> Self {
        Self {
            detector,
            pools,
            sink,
            config,
        }
    }

    /// Run until the report channel closes or shutdown is signalled
    pub fn spawn(
        self,
        mut reports: mpsc::Receiver<PunishReport>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            let mut ticker = tokio::time::interval(self.config.flush_interval());

            loop {
                tokio::select! {
                    report = reports.recv() => match report {
                        Some(report) => {
                            batch.push(report);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => self.flush(&mut batch).await,
                    _ = shutdown.changed() => break,
                }
            }
            self.flush(&mut batch).await;
            info!(target: EVENT_TARGET, "Enforcement log stopped");
        })
    }

    /// Post and clear the batch
    pub async fn flush(&self, batch: &mut Vec<PunishReport>) {
        if batch.is_empty() {
            return;
        }

        let mut by_guild: BTreeMap<u64, Vec<&PunishReport>> = BTreeMap::new();
        for report in batch.iter() {
            by_guild.entry(report.task.guild_id).or_default().push(report);
        }

        for (guild_id, reports) in by_guild {
            let Some(channel_id) = self.detector.log_channel(guild_id) else {
                continue;
            };

            let mut draft = self.pools.embeds.get();
            render(&reports, &mut draft);
            if let Err(error) = self.sink.post(channel_id, &draft).await {
                warn!(
                    target: EVENT_TARGET,
                    guild_id,
                    channel_id,
                    error = %error,
                    "Failed to post enforcement log"
                );
            }
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::ActionKind;
    use crate::detector::GuildPolicy;
    use crate::punish::PunishTask;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, EmbedDraft)>>);

    #[async_trait]
    impl ChannelSink for Recorder {
        async fn post(&self, channel_id: u64, embed: &EmbedDraft) -> Result<(), serenity::Error> {
            self.0.lock().push((channel_id, embed.clone()));
            Ok(())
        }
    }

    fn report(guild_id: u64, user_id: u64, ok: bool) -> PunishReport {
        PunishReport {
            task: PunishTask::new(guild_id, user_id, ActionKind::Ban, "burst"),
            result: if ok {
                Ok(Duration::from_millis(40))
            } else {
                Err("HTTP 403".to_string())
            },
        }
    }

    fn log_with(recorder: Arc<Recorder>, config: NotifyConfig) -> EnforcementLog {
        let policy = GuildPolicy {
            enabled: true,
            log_channel: Some(900),
            ..GuildPolicy::default()
        };
        let detector = Detector::new(2, HashMap::from([(10, policy)]));
        EnforcementLog::new(Arc::new(detector), Arc::new(Pools::new()), recorder, config)
    }

    #[test]
    fn test_render_lines_and_overflow() {
        let reports: Vec<_> = (0..30).map(|u| report(10, u, u != 3)).collect();
        let refs: Vec<_> = reports.iter().collect();
        let mut draft = EmbedDraft::default();
        render(&refs, &mut draft);

        assert_eq!(draft.color, COLOR_FAILED);
        assert!(draft.description.contains("**BAN** <@1> | burst"));
        assert!(draft.description.contains("<@3> failed: HTTP 403"));
        assert!(draft.description.ends_with("*...and 5 more*"));
        assert_eq!(draft.footer, "30 events logged");
    }

    #[tokio::test]
    async fn test_flush_groups_by_configured_guild() {
        let recorder = Arc::new(Recorder::default());
        let log = log_with(recorder.clone(), NotifyConfig::default());

        let mut batch = vec![report(10, 5, true), report(11, 6, true), report(10, 7, true)];
        log.flush(&mut batch).await;

        assert!(batch.is_empty());
        let posted = recorder.0.lock();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, 900);
        assert_eq!(posted[0].1.footer, "2 events logged");
        assert_eq!(log.pools.embeds.idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_triggers_post() {
        let recorder = Arc::new(Recorder::default());
        let config = NotifyConfig {
            batch_size: 2,
            flush_interval_ms: 60_000,
            ..NotifyConfig::default()
        };
        let (tx, rx) = mpsc::channel(8);
        let (_stop, stop_rx) = watch::channel(false);
        let handle = log_with(recorder.clone(), config).spawn(rx, stop_rx);

        tx.send(report(10, 1, true)).await.unwrap();
        tx.send(report(10, 2, true)).await.unwrap();
        tx.send(report(10, 3, true)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let posted = recorder.0.lock();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].1.footer, "2 events logged");
        assert_eq!(posted[1].1.footer, "1 events logged");
    }
}
