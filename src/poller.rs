use crate::engine::{
    DownloadEngineAdapter, EngineState, EngineStatus, NotificationMode, UploadAdapter,
};
use crate::listener::TransferListener;
use crate::registry::Registry;
use crate::schedule::Periodic;
use crate::tasks::{EngineHandle, EngineKind, Stage, StatusRecord, UploadTarget};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};
use tracing::{debug, info, warn};

pub struct EnginePoller {
    registry: Registry,
    adapters: HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>>,
    uploaders: HashMap<UploadTarget, Arc<dyn UploadAdapter>>,
    periodic: Periodic,
    interval: Duration,
    /// Handles that already got their terminal notification.
    notified: Mutex<HashSet<EngineHandle>>,
    me: Weak<EnginePoller>,
}

impl EnginePoller {
    pub fn new(
        registry: Registry,
        adapters: HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>>,
        uploaders: HashMap<UploadTarget, Arc<dyn UploadAdapter>>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            adapters,
            uploaders,
            periodic: Periodic::new("engine_poller"),
            interval,
            notified: Mutex::new(HashSet::new()),
            me: me.clone(),
        })
    }

    pub fn ensure_running(&self) {
        let me = self.me.clone();
        self.periodic.start(self.interval, move || {
            let me = me.clone();
            async move {
                if let Some(poller) = me.upgrade() {
                    poller.tick().await;
                }
            }
        });
    }

    pub fn stop(&self) {
        if self.periodic.stop() {
            debug!(event = "engine_poller_stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }

    pub(crate) async fn tick(&self) {
        let records = self.registry.snapshot();
        for record in &records {
            let Some(handle) = record.handle.clone() else {
                continue;
            };
            if record.stage.is_downloading() {
                self.poll_download(record, handle).await;
            } else if record.stage == Stage::Uploading {
                self.poll_upload(record, &handle);
            }
        }

        let live: HashSet<EngineHandle> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|r| r.handle)
            .collect();
        self.notified.lock().retain(|handle| live.contains(handle));
    }

    async fn poll_download(&self, record: &StatusRecord, handle: EngineHandle) {
        let Some(adapter) = self.adapters.get(&record.engine) else {
            warn!(
                event = "no_adapter_for_engine",
                uid = %record.uid,
                engine = record.engine.label()
            );
            return;
        };
        let polled = adapter.notification_mode() == NotificationMode::Polled;
        match adapter.query_status(&handle).await {
            Ok(status) => {
                self.copy_metrics(record, &handle, &status);
                if polled {
                    self.diff(record, handle, status);
                }
            }
            Err(err) if polled => {
                warn!(
                    event = "engine_query_failed",
                    uid = %record.uid,
                    handle = %handle,
                    error = %err
                );
                if self.claim(&handle) {
                    record.listener.on_download_error(&err.to_string());
                }
            }
            Err(err) => {
                debug!(
                    event = "engine_query_failed",
                    uid = %record.uid,
                    handle = %handle,
                    error = %err
                );
            }
        }
    }

    fn poll_upload(&self, record: &StatusRecord, handle: &EngineHandle) {
        let Some(uploader) = self.uploaders.get(&record.upload_target) else {
            return;
        };
        if let Some(status) = uploader.query_status(handle) {
            self.registry.update(&record.uid, |r| {
                if r.handle.as_ref() == Some(handle) && r.stage == Stage::Uploading {
                    r.metrics = status.metrics;
                }
            });
        }
    }

    fn copy_metrics(&self, record: &StatusRecord, handle: &EngineHandle, status: &EngineStatus) {
        self.registry.update(&record.uid, |r| {
            if r.handle.as_ref() != Some(handle) || !r.stage.is_downloading() {
                return;
            }
            r.metrics = status.metrics.clone();
            if let Some(name) = status.name.as_ref().filter(|n| !n.is_empty()) {
                r.name = Some(name.clone());
            }
            r.flags.torrent |= status.is_torrent;
        });
    }

    fn diff(&self, record: &StatusRecord, handle: EngineHandle, status: EngineStatus) {
        let listener = &record.listener;
        match status.state {
            EngineState::Waiting => {}
            EngineState::Active => {
                if record.stage == Stage::Waiting {
                    listener.on_download_started();
                }
            }
            EngineState::Complete => match status.followed_by {
                Some(next) => {
                    match self.registry.remap_handle(&record.uid, &handle, next.clone()) {
                        Ok(()) => {
                            self.registry.update(&record.uid, |r| r.flags.torrent = true);
                            info!(
                                event = "download_followed",
                                uid = %record.uid,
                                from = %handle,
                                to = %next
                            );
                        }
                        Err(err) => {
                            debug!(event = "remap_skipped", uid = %record.uid, error = %err)
                        }
                    }
                }
                None => {
                    if self.claim(&handle) {
                        listener.on_download_complete();
                    }
                }
            },
            EngineState::Failed => {
                if self.claim(&handle) {
                    let reason = status
                        .error_message
                        .unwrap_or_else(|| "Unknown error".to_string());
                    listener.on_download_error(&reason);
                }
            }
            EngineState::Paused => {
                if self.claim(&handle) {
                    listener.on_download_paused();
                }
            }
        }
    }

    fn claim(&self, handle: &EngineHandle) -> bool {
        self.notified.lock().insert(handle.clone())
    }
}
