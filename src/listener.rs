//! Per-job state machine. Every [`TransferListener`] call becomes a
//! [`JobEvent`] on the job's own channel, consumed one at a time by
//! [`JobListener::run`].

use crate::archive::LocalArchiver;
use crate::engine::UploadAdapter;
use crate::error::ArchiveError;
use crate::messages::Messenger;
use crate::poller::EnginePoller;
use crate::registry::Registry;
use crate::status::{human_size, StatusBroadcaster};
use crate::tasks::{
    safe_file_name, JobId, PipelineOptions, Stage, StatusRecord, TaskOutcome, TransferMetrics,
};
use std::{
    collections::VecDeque,
    ops::ControlFlow,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Grace period before a download error is acted on, so a completion racing
/// the error for the same handle gets the chance to win.
pub const ERROR_DEBOUNCE: Duration = Duration::from_millis(500);

pub const STOPPED_BY_USER: &str = "Download stopped by user!";
pub const STOPPED_INACTIVE: &str = "Download stopped due to inactivity";

/// Callback contract every download engine and uploader drives.
pub trait TransferListener: Send + Sync {
    fn on_download_started(&self);
    /// Only used by engines without pull-based progress; most never call it.
    fn on_download_progress(&self);
    fn on_download_complete(&self);
    fn on_download_error(&self, reason: &str);
    /// Engine-side pause or stop. Reported as a user stop when the job was
    /// cancelled, as inactivity otherwise.
    fn on_download_paused(&self);
    fn on_upload_started(&self);
    fn on_upload_progress(&self);
    fn on_upload_complete(&self, link: &str);
    fn on_upload_error(&self, reason: &str);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    DownloadStarted,
    DownloadProgress,
    DownloadComplete,
    DownloadError(String),
    DownloadPaused,
    UploadStarted,
    UploadProgress,
    UploadComplete(String),
    UploadError(String),
}

#[derive(Clone, Debug)]
pub struct ListenerHandle {
    uid: JobId,
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ListenerHandle {
    pub fn channel(uid: JobId) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { uid, tx }, rx)
    }

    pub fn as_listener(&self) -> Arc<dyn TransferListener> {
        Arc::new(self.clone())
    }

    fn post(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            trace!(event = "listener_closed", uid = %self.uid);
        }
    }
}

impl TransferListener for ListenerHandle {
    fn on_download_started(&self) {
        self.post(JobEvent::DownloadStarted);
    }

    fn on_download_progress(&self) {
        self.post(JobEvent::DownloadProgress);
    }

    fn on_download_complete(&self) {
        self.post(JobEvent::DownloadComplete);
    }

    fn on_download_error(&self, reason: &str) {
        self.post(JobEvent::DownloadError(reason.to_string()));
    }

    fn on_download_paused(&self) {
        self.post(JobEvent::DownloadPaused);
    }

    fn on_upload_started(&self) {
        self.post(JobEvent::UploadStarted);
    }

    fn on_upload_progress(&self) {
        self.post(JobEvent::UploadProgress);
    }

    fn on_upload_complete(&self, link: &str) {
        self.post(JobEvent::UploadComplete(link.to_string()));
    }

    fn on_upload_error(&self, reason: &str) {
        self.post(JobEvent::UploadError(reason.to_string()));
    }
}

#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Registry,
    pub archiver: Arc<LocalArchiver>,
    pub messenger: Arc<dyn Messenger>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub poller: Arc<EnginePoller>,
    pub index_url: Option<String>,
}

impl PipelineContext {
    pub fn activate(&self) {
        self.broadcaster.ensure_running();
        self.poller.ensure_running();
    }

    pub async fn after_removal(&self, remaining: usize) {
        if remaining > 0 {
            self.broadcaster.refresh().await;
            return;
        }
        self.poller.stop();
        self.broadcaster.stop().await;
        // A job admitted while we were tearing down must keep its loops.
        if !self.registry.is_empty() {
            self.activate();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Download,
    Upload,
}

pub struct JobListener {
    uid: JobId,
    options: PipelineOptions,
    uploader: Arc<dyn UploadAdapter>,
    sender: mpsc::WeakUnboundedSender<JobEvent>,
    ctx: PipelineContext,
    backlog: VecDeque<JobEvent>,
}

impl JobListener {
    /// Spawns the job's event loop and returns the handle engines report to.
    ///
    /// The loop holds only a weak sender: once the record (and every engine
    /// holding a handle) is gone, the channel closes and the task ends.
    pub fn spawn(
        uid: JobId,
        options: PipelineOptions,
        uploader: Arc<dyn UploadAdapter>,
        ctx: PipelineContext,
    ) -> ListenerHandle {
        let (handle, rx) = ListenerHandle::channel(uid.clone());
        let listener = Self {
            uid: uid.clone(),
            options,
            uploader,
            sender: handle.tx.downgrade(),
            ctx,
            backlog: VecDeque::new(),
        };
        tokio::spawn(listener.run(rx).instrument(info_span!("job", uid = %uid)));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
        loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => match rx.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            if self.handle_event(event, &mut rx).await.is_break() {
                break;
            }
        }
        debug!(event = "listener_finished", uid = %self.uid);
    }

    async fn handle_event(
        &mut self,
        event: JobEvent,
        rx: &mut mpsc::UnboundedReceiver<JobEvent>,
    ) -> ControlFlow<()> {
        let Some(record) = self.ctx.registry.get(&self.uid) else {
            debug!(event = "late_event_discarded", uid = %self.uid, ?event);
            return ControlFlow::Break(());
        };
        if record.stage.is_terminal() {
            return ControlFlow::Break(());
        }

        match event {
            JobEvent::DownloadStarted => {
                if record.stage == Stage::Waiting {
                    self.ctx.registry.update(&self.uid, |r| r.stage = Stage::Downloading);
                    info!(event = "download_started", uid = %self.uid);
                }
                self.ctx.activate();
                ControlFlow::Continue(())
            }
            JobEvent::DownloadProgress | JobEvent::UploadProgress => ControlFlow::Continue(()),
            JobEvent::UploadStarted => {
                debug!(event = "upload_started", uid = %self.uid);
                ControlFlow::Continue(())
            }
            JobEvent::DownloadComplete if record.stage.is_downloading() => {
                self.on_download_complete(record).await
            }
            JobEvent::DownloadError(reason) if record.stage.is_downloading() => {
                time::sleep(ERROR_DEBOUNCE).await;
                while let Ok(next) = rx.try_recv() {
                    self.backlog.push_back(next);
                }
                if let Some(pos) = self
                    .backlog
                    .iter()
                    .position(|e| *e == JobEvent::DownloadComplete)
                {
                    self.backlog.remove(pos);
                    info!(
                        event = "error_superseded_by_completion",
                        uid = %self.uid,
                        reason = %reason
                    );
                    let Some(record) = self.ctx.registry.get(&self.uid) else {
                        return ControlFlow::Break(());
                    };
                    return self.on_download_complete(record).await;
                }
                let reason = if self.cancel_requested() {
                    STOPPED_BY_USER.to_string()
                } else {
                    reason
                };
                self.fail(Phase::Download, reason).await
            }
            JobEvent::DownloadPaused if record.stage.is_downloading() => {
                let reason = if record.flags.cancelled_by_user {
                    STOPPED_BY_USER
                } else {
                    STOPPED_INACTIVE
                };
                self.fail(Phase::Download, reason.to_string()).await
            }
            JobEvent::UploadComplete(link) if record.stage == Stage::Uploading => {
                self.succeed(link).await
            }
            JobEvent::UploadError(reason) if record.stage.is_post_download() => {
                self.fail(Phase::Upload, reason).await
            }
            other => {
                debug!(event = "event_ignored", uid = %self.uid, stage = ?record.stage, ?other);
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_download_complete(&mut self, record: StatusRecord) -> ControlFlow<()> {
        let name = match record.name.as_deref().and_then(safe_file_name) {
            Some(name) => name,
            None => first_entry(&record.dest_dir)
                .await
                .unwrap_or_else(|| record.uid.to_string()),
        };
        let mut downloaded = record.dest_dir.join(&name);
        if tokio::fs::metadata(&downloaded).await.is_err() {
            // Engines free to pick their own file name may ignore a custom one.
            if let Some(entry) = first_entry(&record.dest_dir).await {
                downloaded = record.dest_dir.join(entry);
            }
        }
        let rename_to = self.ctx.registry.get(&self.uid).and_then(|r| r.rename_to);
        if let Some(renamed) = rename_to.as_deref().and_then(safe_file_name) {
            let target = record.dest_dir.join(&renamed);
            match tokio::fs::rename(&downloaded, &target).await {
                Ok(()) => downloaded = target,
                Err(err) => {
                    warn!(event = "rename_failed", uid = %self.uid, to = %renamed, error = %err)
                }
            }
        }
        info!(event = "download_complete", uid = %self.uid, name = %name);

        let mut path = if self.options.archive {
            self.ctx.registry.update(&self.uid, |r| {
                r.stage = Stage::Archiving;
                r.flags.archiving = true;
            });
            match self.ctx.archiver.tar(&downloaded).await {
                Ok(path) => path,
                Err(err) => {
                    error!(event = "archive_failed", uid = %self.uid, error = %err);
                    return self
                        .fail(Phase::Upload, "Internal error occurred!!".to_string())
                        .await;
                }
            }
        } else if self.options.extract {
            self.ctx.registry.update(&self.uid, |r| {
                r.stage = Stage::Extracting;
                r.flags.extracting = true;
            });
            match self.ctx.archiver.extract(&downloaded).await {
                Ok(path) => path,
                Err(ArchiveError::NotSupported(_)) => {
                    info!(event = "not_an_archive", uid = %self.uid, "uploading file as it is");
                    downloaded.clone()
                }
                Err(err) => {
                    warn!(
                        event = "extract_failed",
                        uid = %self.uid,
                        error = %err,
                        "uploading anyway"
                    );
                    downloaded.clone()
                }
            }
        } else {
            downloaded.clone()
        };

        if !self.uploader.accepts_directories() && is_dir(&path).await {
            match self.ctx.archiver.tar(&path).await {
                Ok(tarred) => path = tarred,
                Err(err) => {
                    warn!(event = "directory_tar_failed", uid = %self.uid, error = %err);
                    return self
                        .fail(
                            Phase::Upload,
                            "Cannot upload directories to Telegram".to_string(),
                        )
                        .await;
                }
            }
        }

        if self.cancel_requested() {
            info!(event = "cancelled_before_upload", uid = %self.uid);
            return self.fail(Phase::Download, STOPPED_BY_USER.to_string()).await;
        }

        let upload_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(name);
        let size = if record.metrics.total_bytes == 0 || path != downloaded {
            self.ctx.archiver.path_size(&path).await
        } else {
            record.metrics.total_bytes
        };
        self.ctx.registry.update(&self.uid, |r| {
            r.stage = Stage::Uploading;
            r.name = Some(upload_name.clone());
            r.metrics = TransferMetrics {
                total_bytes: size,
                ..TransferMetrics::default()
            };
        });
        info!(event = "upload_handoff", uid = %self.uid, path = %path.display());

        let Some(listener) = self.sender.upgrade().map(|tx| {
            Arc::new(ListenerHandle {
                uid: self.uid.clone(),
                tx,
            }) as Arc<dyn TransferListener>
        }) else {
            return ControlFlow::Break(());
        };
        match self
            .uploader
            .upload(&path, &upload_name, &record.origin, listener)
            .await
        {
            Ok(handle) => {
                if let Err(err) = self.ctx.registry.attach_handle(&self.uid, handle.clone()) {
                    warn!(event = "attach_upload_handle_failed", uid = %self.uid, error = %err);
                }
                // A cancel issued before the upload handle was attached went
                // to the old download handle and was lost.
                if self.cancel_requested() {
                    info!(event = "cancelled_during_handoff", uid = %self.uid, handle = %handle);
                    if let Err(err) = self.uploader.cancel(&handle).await {
                        warn!(event = "upload_cancel_failed", uid = %self.uid, error = %err);
                    }
                }
                ControlFlow::Continue(())
            }
            Err(err) => self.fail(Phase::Upload, err.to_string()).await,
        }
    }

    async fn succeed(&mut self, link: String) -> ControlFlow<()> {
        let Some(record) = self
            .ctx
            .registry
            .begin_terminal(&self.uid, TaskOutcome::Success)
        else {
            return ControlFlow::Break(());
        };
        let name = record.display_name().to_string();
        let size = human_size(record.metrics.total_bytes);
        let mut text = if link.is_empty() {
            format!("{name} ({size}) uploaded.")
        } else {
            format!("<a href=\"{link}\">{name}</a> ({size})")
        };
        if let Some(index) = self.ctx.index_url.as_deref() {
            let is_dir = is_dir(&record.dest_dir.join(&name)).await;
            if let Some(share_url) = share_link(index, &name, is_dir) {
                text.push_str(&format!("\n\n Shareable link: <a href=\"{share_url}\">here</a>"));
            }
        }
        if let Some(tag) = self.options.tag.as_deref() {
            text.push_str(&format!("\ncc: @{tag}"));
        }
        info!(event = "upload_complete", uid = %self.uid, name = %name);
        self.finish(record, text).await
    }

    fn cancel_requested(&self) -> bool {
        self.ctx
            .registry
            .get(&self.uid)
            .is_some_and(|r| r.flags.cancelled_by_user)
    }

    async fn fail(&mut self, phase: Phase, reason: String) -> ControlFlow<()> {
        let cancelled = self.cancel_requested();
        let outcome = if cancelled {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Failed(reason.clone())
        };
        let Some(record) = self.ctx.registry.begin_terminal(&self.uid, outcome) else {
            return ControlFlow::Break(());
        };
        let reason = strip_tags(&reason);
        let text = match phase {
            Phase::Download => format!(
                "{} your download has been stopped due to: {}",
                record.origin.mention, reason
            ),
            Phase::Upload => reason,
        };
        warn!(event = "job_failed", uid = %self.uid, ?phase, text = %text);
        self.finish(record, text).await
    }

    /// Terminal tail shared by success and failure: clean up, deregister,
    /// notify exactly once, then wind down the loops if nothing is left.
    async fn finish(&mut self, record: StatusRecord, text: String) -> ControlFlow<()> {
        clean_download(&record.dest_dir).await;
        let Some((_, remaining)) = self.ctx.registry.remove(&self.uid) else {
            return ControlFlow::Break(());
        };
        if let Err(err) = self
            .ctx
            .messenger
            .reply(record.origin.chat_id, record.origin.message_id, text)
            .await
        {
            error!(event = "notify_failed", uid = %self.uid, error = %err);
        }
        self.ctx.after_removal(remaining).await;
        ControlFlow::Break(())
    }
}

async fn first_entry(dir: &Path) -> Option<String> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let entry = entries.next_entry().await.ok()??;
    Some(entry.file_name().to_string_lossy().into_owned())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub async fn clean_download(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(event = "download_dir_removed", path = %dir.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(event = "download_dir_remove_failed", path = %dir.display(), error = %err)
        }
    }
}

fn strip_tags(reason: &str) -> String {
    reason.replace(['<', '>'], " ")
}

fn share_link(index: &str, name: &str, is_dir: bool) -> Option<String> {
    let mut url = url::Url::parse(index).ok()?;
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty().push(name);
        if is_dir {
            segments.push("");
        }
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{EngineHandle, UploadTarget};
    use crate::testing::{wait_until, Harness};

    #[test]
    fn share_link_encodes_names() {
        assert_eq!(
            share_link("https://index.example", "my file.zip", false).as_deref(),
            Some("https://index.example/my%20file.zip")
        );
        assert_eq!(
            share_link("https://index.example/drive", "folder", true).as_deref(),
            Some("https://index.example/drive/folder/")
        );
    }

    #[test]
    fn tags_are_stripped() {
        assert_eq!(strip_tags("bad <b>link</b>"), "bad  b link  /b ");
    }

    #[tokio::test]
    async fn late_events_after_terminal_are_swallowed() {
        let harness = Harness::new();
        let handle = harness.spawn_job("J9", PipelineOptions::default());
        handle.on_download_started();
        handle.on_download_complete();
        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;

        let upload = uploader.listener(0);
        upload.on_upload_complete("https://drive/x");
        upload.on_upload_complete("https://drive/x");
        upload.on_upload_error("late failure");
        handle.on_download_error("late download error");

        let registry = harness.ctx.registry.clone();
        wait_until(|| registry.is_empty()).await;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.messenger.replies().len(), 1);
    }

    #[tokio::test]
    async fn completion_during_error_debounce_wins() {
        let harness = Harness::new();
        let handle = harness.spawn_job("J8", PipelineOptions::default());
        handle.on_download_started();
        handle.on_download_error("peer vanished");
        handle.on_download_complete();

        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;
        let record = harness.ctx.registry.get(&JobId::from_raw("J8")).unwrap();
        assert_eq!(record.stage, Stage::Uploading);
        assert!(harness.messenger.replies().is_empty());
    }

    #[tokio::test]
    async fn paused_without_cancel_reports_inactivity() {
        let harness = Harness::new();
        let handle = harness.spawn_job("J7", PipelineOptions::default());
        handle.on_download_started();
        handle.on_download_paused();

        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        assert!(harness.ctx.registry.is_empty());
        let replies = messenger.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains(STOPPED_INACTIVE));
    }

    #[tokio::test]
    async fn cancel_during_post_processing_skips_upload() {
        let harness = Harness::new();
        let options = PipelineOptions {
            extract: true,
            ..PipelineOptions::default()
        };
        let handle = harness.spawn_job("J5", options);
        let dest = harness.dest_dir("J5");
        tokio::fs::create_dir_all(&dest).await.unwrap();
        tokio::fs::write(dest.join("f.bin"), b"data").await.unwrap();
        let uid = JobId::from_raw("J5");
        harness.ctx.registry.update(&uid, |r| r.name = Some("f.bin".into()));

        handle.on_download_started();
        harness
            .ctx
            .registry
            .update(&uid, |r| r.flags.cancelled_by_user = true);
        handle.on_download_complete();

        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        assert_eq!(harness.uploader.upload_count(), 0);
        assert_eq!(
            messenger.replies(),
            vec![format!("@user your download has been stopped due to: {STOPPED_BY_USER}")]
        );
        assert!(harness.ctx.registry.is_empty());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancel_racing_upload_handoff_reaches_uploader() {
        let harness = Harness::new();
        let handle = harness.spawn_job("J4", PipelineOptions::default());
        let registry = harness.ctx.registry.clone();
        harness.uploader.during_upload(move || {
            registry.update(&JobId::from_raw("J4"), |r| r.flags.cancelled_by_user = true);
        });

        handle.on_download_started();
        handle.on_download_complete();

        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        assert_eq!(harness.uploader.cancelled(), vec![EngineHandle::from_raw("U1")]);
        assert_eq!(messenger.replies(), vec!["Cancelled by user!".to_string()]);
    }

    #[tokio::test]
    async fn archive_option_tars_before_upload() {
        let harness = Harness::new();
        let options = PipelineOptions {
            archive: true,
            upload_target: UploadTarget::Drive,
            ..PipelineOptions::default()
        };
        let handle = harness.spawn_job("J6", options);
        let dest = harness.dest_dir("J6");
        tokio::fs::create_dir_all(dest.join("album")).await.unwrap();
        tokio::fs::write(dest.join("album").join("a.txt"), b"hello").await.unwrap();
        harness
            .ctx
            .registry
            .update(&JobId::from_raw("J6"), |r| r.name = Some("album".into()));

        handle.on_download_started();
        handle.on_download_complete();
        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;
        let (path, name) = uploader.upload(0);
        assert_eq!(path, dest.join("album.tar"));
        assert_eq!(name, "album.tar");
        let record = harness.ctx.registry.get(&JobId::from_raw("J6")).unwrap();
        assert!(record.flags.archiving);
        assert!(record.metrics.total_bytes > 0);
    }
}
