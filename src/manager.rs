use crate::engine::{AddOptions, DownloadEngineAdapter, UploadAdapter};
use crate::error::{AppError, EngineError};
use crate::listener::{clean_download, JobListener, PipelineContext, TransferListener};
use crate::status::render_snapshot;
use crate::tasks::{
    safe_file_name, EngineHandle, EngineKind, JobId, Origin, PipelineOptions, Source, Stage,
    StatusRecord, UploadTarget,
};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tracing::{error, info, instrument, warn, Instrument};

const ENGINE_SETUP_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_NAME_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct JobRequest {
    pub uid: JobId,
    pub source: Source,
    pub engine: EngineKind,
    pub options: PipelineOptions,
    pub origin: Origin,
}

#[derive(Clone)]
pub struct JobManager {
    ctx: PipelineContext,
    adapters: HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>>,
    uploaders: HashMap<UploadTarget, Arc<dyn UploadAdapter>>,
    download_dir: PathBuf,
    setup_timeout: Duration,
}

impl JobManager {
    pub fn new(
        ctx: PipelineContext,
        adapters: HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>>,
        uploaders: HashMap<UploadTarget, Arc<dyn UploadAdapter>>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            ctx,
            adapters,
            uploaders,
            download_dir,
            setup_timeout: ENGINE_SETUP_TIMEOUT,
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn supports(&self, engine: EngineKind) -> bool {
        self.adapters.contains_key(&engine)
    }

    pub fn supports_upload(&self, target: UploadTarget) -> bool {
        self.uploaders.contains_key(&target)
    }

    /// On setup failure the record is rolled back without any user message;
    /// the caller reports the error.
    #[instrument(skip(self, request), fields(uid = %request.uid, engine = request.engine.label()))]
    pub async fn create_job(&self, request: JobRequest) -> Result<JobId, AppError> {
        let JobRequest {
            uid,
            source,
            engine,
            options,
            origin,
        } = request;
        if let Some(name) = &options.custom_name {
            if safe_file_name(name).is_none() {
                return Err(AppError::InvalidName(name.clone()));
            }
        }
        let adapter = self.adapters.get(&engine).cloned().ok_or_else(|| {
            AppError::Internal(format!("{} is not configured", engine.label()))
        })?;
        let uploader = self
            .uploaders
            .get(&options.upload_target)
            .cloned()
            .ok_or_else(|| AppError::Internal("upload target is not configured".to_string()))?;

        let dest_dir = self.download_dir.join(uid.as_str());
        let add_options = AddOptions {
            custom_name: options.custom_name.clone(),
        };
        let upload_target = options.upload_target;
        let custom_name = options.custom_name.clone();
        let listener = JobListener::spawn(uid.clone(), options, uploader, self.ctx.clone());
        let mut record = StatusRecord::new(
            uid.clone(),
            engine,
            upload_target,
            dest_dir.clone(),
            origin,
            listener.clone(),
        );
        record.name = custom_name;
        self.ctx.registry.put(record)?;

        let mut add = tokio::spawn({
            let adapter = adapter.clone();
            let dest_dir = dest_dir.clone();
            let transfer = listener.as_listener();
            async move {
                adapter
                    .add_download(&source, &dest_dir, &add_options, transfer)
                    .await
            }
            .in_current_span()
        });
        let added = match time::timeout(self.setup_timeout, &mut add).await {
            Ok(joined) => {
                joined.unwrap_or_else(|err| Err(EngineError::Unreachable(err.to_string())))
            }
            Err(_) => {
                cancel_late_download(adapter.clone(), add, uid.clone());
                Err(EngineError::Timeout(self.setup_timeout))
            }
        };

        match added {
            Ok(handle) => {
                info!(event = "job_created", uid = %uid, handle = %handle);
                let attached = self.ctx.registry.attach_download_handle(&uid, handle.clone());
                if matches!(attached, Ok(true)) {
                    self.ctx.activate();
                    let cancelled = self
                        .ctx
                        .registry
                        .get(&uid)
                        .is_some_and(|r| r.flags.cancelled_by_user);
                    if cancelled {
                        self.cancel_engine(&adapter, &uid, &handle).await;
                    }
                }
                Ok(uid)
            }
            Err(err) => {
                error!(event = "engine_setup_failed", uid = %uid, error = %err);
                clean_download(&dest_dir).await;
                if let Some((_, remaining)) = self.ctx.registry.remove(&uid) {
                    self.ctx.after_removal(remaining).await;
                }
                Err(err.into())
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn cancel_job(&self, uid: &JobId) -> Result<(), AppError> {
        let record = self
            .ctx
            .registry
            .update(uid, |r| {
                r.flags.cancelled_by_user = true;
                r.clone()
            })
            .ok_or_else(|| AppError::JobNotFound(uid.to_string()))?;
        info!(event = "job_cancel_requested", uid = %uid, stage = record.stage.label());

        let Some(handle) = record.handle.clone() else {
            return Ok(());
        };
        match record.stage {
            Stage::Waiting | Stage::Downloading => {
                if let Some(adapter) = self.adapters.get(&record.engine) {
                    self.cancel_engine(adapter, uid, &handle).await;
                }
            }
            Stage::Uploading => {
                if let Some(uploader) = self.uploaders.get(&record.upload_target) {
                    if let Err(err) = uploader.cancel(&handle).await {
                        warn!(event = "upload_cancel_failed", uid = %uid, error = %err);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn cancel_all(&self) -> usize {
        let records = self.ctx.registry.snapshot();
        let mut cancelled = 0;
        for record in records {
            if self.cancel_job(&record.uid).await.is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn snapshot_text(&self) -> String {
        render_snapshot(&self.ctx.registry.snapshot())
    }

    /// Returns the name the job was shown under before.
    #[instrument(skip(self))]
    pub fn rename_job(&self, uid: &JobId, name: &str) -> Result<String, AppError> {
        let name = safe_file_name(name)
            .filter(|n| n.len() <= MAX_NAME_LEN)
            .ok_or_else(|| AppError::InvalidName(name.to_string()))?;
        let renamed = self
            .ctx
            .registry
            .update(uid, |r| {
                if !r.flags.torrent {
                    return Err(AppError::RenameRefused(
                        "only torrent downloads can be renamed".to_string(),
                    ));
                }
                if !r.stage.is_downloading() {
                    return Err(AppError::RenameRefused(format!(
                        "the download is {}",
                        r.stage.label().trim_end_matches("...").to_lowercase()
                    )));
                }
                let previous = r.display_name().to_string();
                r.rename_to = Some(name.clone());
                Ok(previous)
            })
            .ok_or_else(|| AppError::JobNotFound(uid.to_string()))?;
        if let Ok(previous) = &renamed {
            info!(event = "job_renamed", uid = %uid, from = %previous, to = %name);
        }
        renamed
    }

    pub fn torrent_jobs(&self) -> Vec<StatusRecord> {
        self.ctx
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| r.flags.torrent && r.stage.is_downloading() && r.handle.is_some())
            .collect()
    }

    pub fn find_job_by_handle(&self, handle: &EngineHandle) -> Option<StatusRecord> {
        self.ctx.registry.find_by_handle(handle)
    }

    pub fn is_idle(&self) -> bool {
        self.ctx.registry.is_empty()
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    async fn cancel_engine(
        &self,
        adapter: &Arc<dyn DownloadEngineAdapter>,
        uid: &JobId,
        handle: &EngineHandle,
    ) {
        let Err(err) = adapter.cancel(handle).await else {
            return;
        };
        warn!(event = "engine_cancel_failed", uid = %uid, handle = %handle, error = %err);
        let Err(err) = adapter.pause(handle).await else {
            return;
        };
        warn!(event = "engine_pause_failed", uid = %uid, handle = %handle, error = %err);
        // Nothing left on the engine side will ever report back.
        if let Some(record) = self.ctx.registry.get(uid) {
            record.listener.on_download_error(&err.to_string());
        }
    }
}

// The job is gone; a download the engine accepts late must not keep running.
fn cancel_late_download(
    adapter: Arc<dyn DownloadEngineAdapter>,
    add: JoinHandle<Result<EngineHandle, EngineError>>,
    uid: JobId,
) {
    tokio::spawn(
        async move {
            let Ok(Ok(handle)) = add.await else {
                return;
            };
            match adapter.cancel(&handle).await {
                Ok(()) => info!(event = "late_download_cancelled", uid = %uid, handle = %handle),
                Err(err) => warn!(
                    event = "late_download_cancel_failed",
                    uid = %uid,
                    handle = %handle,
                    error = %err
                ),
            }
        }
        .in_current_span(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::STOPPED_BY_USER;
    use crate::testing::{origin, wait_until, Harness, ScriptedEngine};

    fn request(uid: &str) -> JobRequest {
        JobRequest {
            uid: JobId::from_raw(uid),
            source: Source::Uri("https://example.com/file.bin".into()),
            engine: EngineKind::Aria2,
            options: PipelineOptions::default(),
            origin: origin(),
        }
    }

    #[tokio::test]
    async fn download_then_upload_reports_link_once() {
        let harness = Harness::new();
        let manager = harness.manager();
        let uid = manager.create_job(request("J1")).await.unwrap();
        assert!(!manager.is_idle());
        assert!(manager.find_job_by_handle(&EngineHandle::from_raw("G1")).is_some());

        let dest = harness.dest_dir("J1");
        tokio::fs::create_dir_all(&dest).await.unwrap();
        tokio::fs::write(dest.join("file.bin"), vec![0u8; 2048]).await.unwrap();
        harness.ctx.registry.update(&uid, |r| r.name = Some("file.bin".into()));

        let download = harness.engine.listener(0);
        download.on_download_started();
        download.on_download_complete();
        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;
        assert_eq!(uploader.upload(0).0, dest.join("file.bin"));

        uploader.listener(0).on_upload_complete("https://drive.google.com/uc?id=x");
        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        let (poller, broadcaster) = (harness.ctx.poller.clone(), harness.ctx.broadcaster.clone());
        wait_until(|| !poller.is_running() && !broadcaster.is_running()).await;

        let replies = messenger.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            "<a href=\"https://drive.google.com/uc?id=x\">file.bin</a> (2.0 KB)"
        );
        assert!(!dest.exists());
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn extracting_a_plain_file_uploads_it_unchanged() {
        let harness = Harness::new();
        let manager = harness.manager();
        let mut req = request("J2");
        req.options.extract = true;
        let uid = manager.create_job(req).await.unwrap();

        let dest = harness.dest_dir("J2");
        tokio::fs::create_dir_all(&dest).await.unwrap();
        tokio::fs::write(dest.join("notes.txt"), b"plain").await.unwrap();
        harness.ctx.registry.update(&uid, |r| r.name = Some("notes.txt".into()));

        harness.engine.listener(0).on_download_complete();
        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;
        let (path, name) = uploader.upload(0);
        assert_eq!(path, dest.join("notes.txt"));
        assert_eq!(name, "notes.txt");
        assert!(harness.messenger.replies().is_empty());
    }

    #[tokio::test]
    async fn cancel_while_downloading_reports_user_stop_once() {
        let harness = Harness::new();
        let manager = harness.manager();
        let uid = manager.create_job(request("J3")).await.unwrap();
        harness.engine.listener(0).on_download_started();

        manager.cancel_job(&uid).await.unwrap();
        assert_eq!(harness.engine.cancelled(), vec![EngineHandle::from_raw("G1")]);

        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        assert!(manager.is_idle());
        harness.engine.listener(0).on_download_error("late");
        time::sleep(Duration::from_millis(50)).await;

        let replies = harness.messenger.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            format!("@user your download has been stopped due to: {STOPPED_BY_USER}")
        );
    }

    #[tokio::test]
    async fn refused_cancel_falls_back_to_pause() {
        let harness = Harness::new();
        harness.engine.refuse_cancels();
        let manager = harness.manager();
        let uid = manager.create_job(request("J3b")).await.unwrap();

        manager.cancel_job(&uid).await.unwrap();
        assert_eq!(harness.engine.paused(), vec![EngineHandle::from_raw("G1")]);

        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        assert!(harness.messenger.replies()[0].ends_with(STOPPED_BY_USER));
    }

    #[tokio::test]
    async fn setup_failure_rolls_back_silently() {
        let engine = ScriptedEngine::push();
        engine.fail_adds(EngineError::Unreachable("connection refused".into()));
        let harness = Harness::with_engine(engine);
        let manager = harness.manager();

        let err = manager.create_job(request("J4")).await.unwrap_err();
        assert!(matches!(err, AppError::Engine(EngineError::Unreachable(_))));
        assert!(manager.is_idle());
        assert!(harness.messenger.replies().is_empty());
        assert!(!harness.dest_dir("J4").exists());
        assert!(harness.download_root().exists());
    }

    #[tokio::test]
    async fn slow_engines_time_out() {
        let engine = ScriptedEngine::push();
        engine.delay_adds(Duration::from_secs(5));
        let harness = Harness::with_engine(engine);
        let manager = harness.manager().with_setup_timeout(Duration::from_millis(20));

        let err = manager.create_job(request("J5")).await.unwrap_err();
        assert!(matches!(err, AppError::Engine(EngineError::Timeout(_))));
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn late_engine_answer_is_cancelled_after_timeout() {
        let engine = ScriptedEngine::push();
        engine.delay_adds(Duration::from_millis(100));
        let harness = Harness::with_engine(engine);
        let manager = harness.manager().with_setup_timeout(Duration::from_millis(20));

        let err = manager.create_job(request("J5b")).await.unwrap_err();
        assert!(matches!(err, AppError::Engine(EngineError::Timeout(_))));
        assert!(manager.is_idle());
        let engine = harness.engine.clone();
        wait_until(|| engine.cancelled() == vec![EngineHandle::from_raw("G1")]).await;
        assert!(harness.messenger.replies().is_empty());
    }

    #[tokio::test]
    async fn hostile_custom_names_are_refused() {
        let harness = Harness::new();
        let manager = harness.manager();
        for name in ["../../etc/cron.d/x", "..", "a/b"] {
            let mut req = request("J5c");
            req.options.custom_name = Some(name.to_string());
            let err = manager.create_job(req).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidName(_)), "{name} accepted");
        }
        assert_eq!(harness.engine.added(), 0);
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn torrents_are_renamed_before_upload() {
        let harness = Harness::new();
        let manager = harness.manager();
        let uid = manager.create_job(request("J10")).await.unwrap();
        harness.ctx.registry.update(&uid, |r| {
            r.name = Some("ubuntu".into());
            r.flags.torrent = true;
        });
        assert_eq!(manager.torrent_jobs().len(), 1);

        let previous = manager.rename_job(&uid, "Better Name").unwrap();
        assert_eq!(previous, "ubuntu");
        let record = harness.ctx.registry.get(&uid).unwrap();
        assert_eq!(record.display_name(), "Better Name");

        let dest = harness.dest_dir("J10");
        tokio::fs::create_dir_all(dest.join("ubuntu")).await.unwrap();
        tokio::fs::write(dest.join("ubuntu/disk.iso"), b"iso").await.unwrap();
        let download = harness.engine.listener(0);
        download.on_download_started();
        download.on_download_complete();
        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;
        let (path, name) = uploader.upload(0);
        assert_eq!(path, dest.join("Better Name"));
        assert_eq!(name, "Better Name");
        assert!(path.join("disk.iso").exists());
        assert!(manager.torrent_jobs().is_empty());
    }

    #[tokio::test]
    async fn rename_is_refused_outside_downloading_torrents() {
        let harness = Harness::new();
        let manager = harness.manager();
        let uid = manager.create_job(request("J11")).await.unwrap();

        let err = manager.rename_job(&uid, "x").unwrap_err();
        assert!(matches!(err, AppError::RenameRefused(_)));
        assert!(manager.torrent_jobs().is_empty());

        harness.ctx.registry.update(&uid, |r| {
            r.flags.torrent = true;
            r.stage = Stage::Uploading;
        });
        let err = manager.rename_job(&uid, "x").unwrap_err();
        assert!(err.to_string().contains("uploading"), "{err}");

        harness.ctx.registry.update(&uid, |r| r.stage = Stage::Downloading);
        let long = "n".repeat(256);
        for name in ["", "../x", "a|b", long.as_str()] {
            let err = manager.rename_job(&uid, name).unwrap_err();
            assert!(matches!(err, AppError::InvalidName(_)), "{name} accepted");
        }
        assert!(harness.ctx.registry.get(&uid).unwrap().rename_to.is_none());

        let err = manager.rename_job(&JobId::from_raw("nope"), "x").unwrap_err();
        assert!(matches!(err, AppError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_uid_is_rejected() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.create_job(request("J6")).await.unwrap();
        let err = manager.create_job(request("J6")).await.unwrap_err();
        assert!(matches!(err, AppError::Registry(_)));
        assert_eq!(harness.engine.added(), 1);
    }

    #[tokio::test]
    async fn unknown_jobs_cannot_be_cancelled() {
        let harness = Harness::new();
        let manager = harness.manager();
        let err = manager.cancel_job(&JobId::from_raw("nope")).await.unwrap_err();
        assert!(matches!(err, AppError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_during_upload_goes_to_uploader() {
        let harness = Harness::new();
        let manager = harness.manager();
        let uid = manager.create_job(request("J7")).await.unwrap();
        harness.engine.listener(0).on_download_complete();
        let uploader = harness.uploader.clone();
        wait_until(|| uploader.upload_count() == 1).await;
        let registry = harness.ctx.registry.clone();
        let watched = uid.clone();
        wait_until(|| {
            registry
                .get(&watched)
                .is_some_and(|r| r.handle == Some(EngineHandle::from_raw("U1")))
        })
        .await;

        manager.cancel_job(&uid).await.unwrap();
        assert_eq!(uploader.cancelled(), vec![EngineHandle::from_raw("U1")]);
        let messenger = harness.messenger.clone();
        wait_until(|| !messenger.replies().is_empty()).await;
        assert_eq!(messenger.replies(), vec!["Cancelled by user!".to_string()]);
        assert!(harness.engine.cancelled().is_empty());
    }

    #[tokio::test]
    async fn cancel_all_and_snapshot() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.create_job(request("J8")).await.unwrap();
        manager.create_job(request("J9")).await.unwrap();
        let text = manager.snapshot_text();
        assert!(text.contains("J8") && text.contains("J9"));

        assert_eq!(manager.cancel_all().await, 2);
        let messenger = harness.messenger.clone();
        wait_until(|| messenger.replies().len() == 2).await;
        assert_eq!(manager.snapshot_text(), "");
    }
}
