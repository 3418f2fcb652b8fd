use crate::error::AppError;
use crate::messages::Messenger;
use crate::registry::Registry;
use crate::schedule::Periodic;
use crate::tasks::{Stage, StatusRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    fmt::Write as _,
    sync::{Arc, Weak},
    time::Duration,
};
use teloxide::types::{ChatId, MessageId};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const NO_ACTIVE_DOWNLOADS: &str = "No Active Downloads !";

#[derive(Clone, Debug)]
struct StatusMessage {
    message_id: MessageId,
    last_text: Option<String>,
}

pub struct StatusBroadcaster {
    registry: Registry,
    messenger: Arc<dyn Messenger>,
    subscribers: DashMap<ChatId, StatusMessage>,
    changes: Mutex<watch::Receiver<u64>>,
    periodic: Periodic,
    interval: Duration,
    me: Weak<StatusBroadcaster>,
}

impl StatusBroadcaster {
    pub fn new(registry: Registry, messenger: Arc<dyn Messenger>, interval: Duration) -> Arc<Self> {
        let changes = Mutex::new(registry.subscribe());
        Arc::new_cyclic(|me| Self {
            registry,
            messenger,
            subscribers: DashMap::new(),
            changes,
            periodic: Periodic::new("status_broadcaster"),
            interval,
            me: me.clone(),
        })
    }

    pub fn ensure_running(&self) {
        let me = self.me.clone();
        self.periodic.start(self.interval, move || {
            let me = me.clone();
            async move {
                if let Some(broadcaster) = me.upgrade() {
                    broadcaster.tick().await;
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }

    pub async fn stop(&self) {
        if self.periodic.stop() {
            debug!(event = "status_broadcaster_stopped", subscribers = self.subscriber_count());
        }
        let chats: Vec<ChatId> = self.subscribers.iter().map(|e| *e.key()).collect();
        for chat_id in chats {
            let Some((_, message)) = self.subscribers.remove(&chat_id) else {
                continue;
            };
            if let Err(err) = self.messenger.delete(chat_id, message.message_id).await {
                warn!(event = "status_delete_failed", chat = chat_id.0, error = %err);
            }
        }
    }

    pub async fn send_status_message(
        &self,
        chat_id: ChatId,
        reply_to: MessageId,
    ) -> Result<MessageId, AppError> {
        let mut text = self.snapshot_text();
        if text.is_empty() {
            text = NO_ACTIVE_DOWNLOADS.to_string();
        }
        if let Some((_, previous)) = self.subscribers.remove(&chat_id) {
            if let Err(err) = self.messenger.delete(chat_id, previous.message_id).await {
                warn!(event = "status_delete_failed", chat = chat_id.0, error = %err);
            }
        }
        let message_id = self.messenger.reply(chat_id, reply_to, text.clone()).await?;
        self.subscribers.insert(
            chat_id,
            StatusMessage {
                message_id,
                last_text: Some(text),
            },
        );
        if !self.registry.is_empty() {
            self.ensure_running();
        }
        Ok(message_id)
    }

    pub async fn refresh(&self) {
        let text = self.snapshot_text();
        if text.is_empty() {
            return;
        }
        let stale: Vec<(ChatId, MessageId)> = self
            .subscribers
            .iter()
            .filter(|e| e.last_text.as_deref() != Some(text.as_str()))
            .map(|e| (*e.key(), e.message_id))
            .collect();
        for (chat_id, message_id) in stale {
            match self.messenger.edit(chat_id, message_id, text.clone()).await {
                Ok(()) => {
                    if let Some(mut entry) = self.subscribers.get_mut(&chat_id) {
                        if entry.message_id == message_id {
                            entry.last_text = Some(text.clone());
                        }
                    }
                }
                Err(err) => warn!(event = "status_edit_failed", chat = chat_id.0, error = %err),
            }
        }
    }

    pub fn snapshot_text(&self) -> String {
        render_snapshot(&self.registry.snapshot())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    async fn tick(&self) {
        let changed = {
            let mut changes = self.changes.lock();
            let changed = changes.has_changed().unwrap_or(false);
            changes.borrow_and_update();
            changed
        };
        if changed {
            self.refresh().await;
        }
    }
}

/// Renders live records; terminal ones are skipped and an empty registry
/// renders as an empty string.
pub fn render_snapshot(records: &[StatusRecord]) -> String {
    let mut text = String::new();
    for record in records.iter().filter(|r| !r.stage.is_terminal()) {
        render_record(&mut text, record);
    }
    text
}

fn render_record(out: &mut String, record: &StatusRecord) {
    let _ = writeln!(out, "<b>{}</b>", escape_html(record.display_name()));
    let _ = writeln!(out, "<b>{}</b>", record.stage.label());
    if matches!(record.stage, Stage::Downloading | Stage::Uploading) {
        let metrics = &record.metrics;
        let percent = metrics.percent();
        let _ = writeln!(out, "<code>{}</code> {:.2}%", progress_bar(percent), percent);
        let verb = if record.stage == Stage::Uploading {
            "Uploaded"
        } else {
            "Downloaded"
        };
        let _ = writeln!(
            out,
            "<b>{verb}:</b> {} of {}",
            human_size(metrics.processed_bytes),
            human_size(metrics.total_bytes)
        );
        let eta = metrics
            .eta
            .map(readable_time)
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "<b>Speed:</b> {}/s, <b>ETA:</b> {eta}",
            human_size(metrics.speed_bps)
        );
    }
    if let Some(handle) = record.handle.as_ref() {
        let _ = writeln!(out, "<b>GID:</b> <code>{handle}</code>");
    }
    let _ = writeln!(out, "<b>Engine:</b> {}", record.engine.label());
    out.push('\n');
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f >= GB {
        format!("{:.2} GB", bytes_f / GB)
    } else if bytes_f >= MB {
        format!("{:.1} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{} B", bytes)
    }
}

pub fn readable_time(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        let value = seconds / size;
        if value > 0 {
            let _ = write!(out, "{value}{unit}");
            seconds %= size;
        }
    }
    let _ = write!(out, "{seconds}s");
    out
}

/// Twelve-cell bar with eighth-block resolution.
pub fn progress_bar(percent: f64) -> String {
    const PARTIALS: [char; 7] = ['▏', '▎', '▍', '▌', '▋', '▊', '▉'];
    const CELLS: usize = 12;
    let p = percent.clamp(0.0, 100.0).round() as usize;
    let full = (p / 8).min(CELLS);
    let mut bar = "█".repeat(full);
    if full < CELLS {
        if let Some(part) = (p % 8).checked_sub(1) {
            bar.push(PARTIALS[part]);
        }
    }
    let used = bar.chars().count();
    bar.push_str(&" ".repeat(CELLS - used));
    format!("[{bar}]")
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::JobId;
    use crate::testing::{record, RecordingMessenger};

    fn broadcaster(registry: &Registry) -> (Arc<StatusBroadcaster>, Arc<RecordingMessenger>) {
        let messenger = Arc::new(RecordingMessenger::default());
        let broadcaster =
            StatusBroadcaster::new(registry.clone(), messenger.clone(), Duration::from_secs(60));
        (broadcaster, messenger)
    }

    #[test]
    fn sizes_and_times_render() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(readable_time(Duration::from_secs(3_725)), "1h2m5s");
        assert_eq!(readable_time(Duration::from_secs(9)), "9s");
    }

    #[test]
    fn progress_bar_is_fixed_width() {
        assert_eq!(progress_bar(0.0), format!("[{}]", " ".repeat(12)));
        assert_eq!(progress_bar(100.0), format!("[{}]", "█".repeat(12)));
        assert_eq!(progress_bar(50.0).chars().count(), 14);
    }

    #[test]
    fn snapshot_skips_terminal_records() {
        assert_eq!(render_snapshot(&[]), "");
        let mut job = record("J1");
        job.name = Some("a<b>.iso".into());
        job.stage = Stage::Downloading;
        let mut done = record("J2");
        done.stage = Stage::Terminal(crate::tasks::TaskOutcome::Success);
        let text = render_snapshot(&[job, done]);
        assert!(text.contains("a&lt;b&gt;.iso"));
        assert!(text.contains("Downloading..."));
        assert!(!text.contains("J2"));
    }

    #[tokio::test]
    async fn status_message_replaces_previous_one_per_chat() {
        let registry = Registry::new();
        let (broadcaster, messenger) = broadcaster(&registry);
        let first = broadcaster
            .send_status_message(ChatId(1), MessageId(100))
            .await
            .unwrap();
        broadcaster
            .send_status_message(ChatId(1), MessageId(101))
            .await
            .unwrap();
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(messenger.deleted(), vec![first]);
        assert!(!broadcaster.is_running());
    }

    #[tokio::test]
    async fn refresh_only_edits_changed_text() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let (broadcaster, messenger) = broadcaster(&registry);
        broadcaster
            .send_status_message(ChatId(1), MessageId(100))
            .await
            .unwrap();
        broadcaster.refresh().await;
        assert!(messenger.edits().is_empty());

        registry.update(&JobId::from_raw("J1"), |r| r.stage = Stage::Downloading);
        broadcaster.refresh().await;
        broadcaster.refresh().await;
        assert_eq!(messenger.edits().len(), 1);
    }

    #[tokio::test]
    async fn stop_deletes_status_messages() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let (broadcaster, messenger) = broadcaster(&registry);
        let id = broadcaster
            .send_status_message(ChatId(7), MessageId(1))
            .await
            .unwrap();
        assert!(broadcaster.is_running());

        broadcaster.stop().await;
        assert!(!broadcaster.is_running());
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(messenger.deleted(), vec![id]);
    }
}
