use crate::archive::LocalArchiver;
use crate::engine::{
    AddOptions, DownloadEngineAdapter, EngineStatus, NotificationMode, UploadAdapter,
};
use crate::error::{AppError, EngineError};
use crate::listener::{JobEvent, JobListener, ListenerHandle, PipelineContext, TransferListener};
use crate::manager::JobManager;
use crate::messages::Messenger;
use crate::poller::EnginePoller;
use crate::registry::Registry;
use crate::status::StatusBroadcaster;
use crate::tasks::{
    EngineHandle, EngineKind, JobId, Origin, PipelineOptions, Source, StatusRecord, UploadTarget,
};
use crate::upload::UPLOAD_CANCELLED;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use teloxide::types::{ChatId, MessageId};
use tokio::{sync::mpsc, time};

const SLOW_TICK: Duration = Duration::from_secs(60);

pub fn origin() -> Origin {
    Origin {
        chat_id: ChatId(1),
        message_id: MessageId(1),
        mention: "@user".to_string(),
    }
}

pub fn record_with_events(uid: &str) -> (StatusRecord, mpsc::UnboundedReceiver<JobEvent>) {
    let uid = JobId::from_raw(uid);
    let (listener, events) = ListenerHandle::channel(uid.clone());
    let dest_dir = std::env::temp_dir().join("mirror-bot-tests").join(uid.as_str());
    let record = StatusRecord::new(
        uid,
        EngineKind::Aria2,
        UploadTarget::Drive,
        dest_dir,
        origin(),
        listener,
    );
    (record, events)
}

pub fn record(uid: &str) -> StatusRecord {
    record_with_events(uid).0
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
pub struct RecordingMessenger {
    next_id: AtomicI32,
    replies: Mutex<Vec<(ChatId, String)>>,
    edits: Mutex<Vec<(MessageId, String)>>,
    deleted: Mutex<Vec<MessageId>>,
}

impl RecordingMessenger {
    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn edits(&self) -> Vec<(MessageId, String)> {
        self.edits.lock().clone()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn reply(
        &self,
        chat_id: ChatId,
        _reply_to: MessageId,
        text: String,
    ) -> Result<MessageId, AppError> {
        self.replies.lock().push((chat_id, text));
        Ok(MessageId(1000 + self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn edit(
        &self,
        _chat_id: ChatId,
        message_id: MessageId,
        text: String,
    ) -> Result<(), AppError> {
        self.edits.lock().push((message_id, text));
        Ok(())
    }

    async fn delete(&self, _chat_id: ChatId, message_id: MessageId) -> Result<(), AppError> {
        self.deleted.lock().push(message_id);
        Ok(())
    }
}

/// Engine fake: statuses are scripted per handle, listeners are kept so
/// tests can drive push callbacks by hand. `cancel` behaves like aria2 and
/// reports the download as paused.
pub struct ScriptedEngine {
    mode: NotificationMode,
    statuses: Mutex<HashMap<String, EngineStatus>>,
    added: Mutex<Vec<(EngineHandle, Arc<dyn TransferListener>)>>,
    cancelled: Mutex<Vec<EngineHandle>>,
    paused: Mutex<Vec<EngineHandle>>,
    refuse_cancel: Mutex<bool>,
    failure: Mutex<Option<EngineError>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedEngine {
    fn with_mode(mode: NotificationMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            statuses: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            paused: Mutex::new(Vec::new()),
            refuse_cancel: Mutex::new(false),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
        })
    }

    pub fn polled() -> Arc<Self> {
        Self::with_mode(NotificationMode::Polled)
    }

    pub fn push() -> Arc<Self> {
        Self::with_mode(NotificationMode::Push)
    }

    pub fn set_status(&self, handle: &str, status: EngineStatus) {
        self.statuses.lock().insert(handle.to_string(), status);
    }

    pub fn fail_adds(&self, err: EngineError) {
        *self.failure.lock() = Some(err);
    }

    pub fn delay_adds(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Makes `cancel` fail so callers fall back to `pause`.
    pub fn refuse_cancels(&self) {
        *self.refuse_cancel.lock() = true;
    }

    pub fn paused(&self) -> Vec<EngineHandle> {
        self.paused.lock().clone()
    }

    fn listener_for(&self, handle: &EngineHandle) -> Option<Arc<dyn TransferListener>> {
        self.added
            .lock()
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, l)| l.clone())
    }

    pub fn added(&self) -> usize {
        self.added.lock().len()
    }

    pub fn listener(&self, index: usize) -> Arc<dyn TransferListener> {
        self.added.lock()[index].1.clone()
    }

    pub fn cancelled(&self) -> Vec<EngineHandle> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl DownloadEngineAdapter for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Aria2
    }

    fn notification_mode(&self) -> NotificationMode {
        self.mode
    }

    async fn add_download(
        &self,
        _source: &Source,
        _dest_dir: &Path,
        _options: &AddOptions,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        let mut added = self.added.lock();
        let handle = EngineHandle::from_raw(format!("G{}", added.len() + 1));
        added.push((handle.clone(), listener));
        Ok(handle)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.cancelled.lock().push(handle.clone());
        if *self.refuse_cancel.lock() {
            return Err(EngineError::Rpc {
                code: 1,
                message: "remove refused".into(),
            });
        }
        if let Some(listener) = self.listener_for(handle) {
            listener.on_download_paused();
        }
        Ok(())
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.paused.lock().push(handle.clone());
        if let Some(listener) = self.listener_for(handle) {
            listener.on_download_paused();
        }
        Ok(())
    }

    async fn query_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        self.statuses
            .lock()
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<(EngineHandle, PathBuf, String, Arc<dyn TransferListener>)>>,
    statuses: Mutex<HashMap<String, EngineStatus>>,
    cancelled: Mutex<Vec<EngineHandle>>,
    during_upload: Mutex<Option<Hook>>,
}

impl RecordingUploader {
    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn listener(&self, index: usize) -> Arc<dyn TransferListener> {
        self.uploads.lock()[index].3.clone()
    }

    pub fn upload(&self, index: usize) -> (PathBuf, String) {
        let uploads = self.uploads.lock();
        (uploads[index].1.clone(), uploads[index].2.clone())
    }

    pub fn set_status(&self, handle: &str, status: EngineStatus) {
        self.statuses.lock().insert(handle.to_string(), status);
    }

    pub fn cancelled(&self) -> Vec<EngineHandle> {
        self.cancelled.lock().clone()
    }

    /// Runs `hook` inside the next `upload` call, before it returns a handle.
    pub fn during_upload(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.during_upload.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl UploadAdapter for RecordingUploader {
    fn target(&self) -> UploadTarget {
        UploadTarget::Drive
    }

    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
        _origin: &Origin,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        if let Some(hook) = self.during_upload.lock().take() {
            hook();
        }
        let mut uploads = self.uploads.lock();
        let handle = EngineHandle::from_raw(format!("U{}", uploads.len() + 1));
        uploads.push((
            handle.clone(),
            path.to_path_buf(),
            display_name.to_string(),
            listener,
        ));
        Ok(handle)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.cancelled.lock().push(handle.clone());
        let listener = self
            .uploads
            .lock()
            .iter()
            .find(|(h, ..)| h == handle)
            .map(|(.., l)| l.clone());
        if let Some(listener) = listener {
            listener.on_upload_error(UPLOAD_CANCELLED);
        }
        Ok(())
    }

    fn query_status(&self, handle: &EngineHandle) -> Option<EngineStatus> {
        self.statuses.lock().get(handle.as_str()).cloned()
    }
}

pub struct Harness {
    pub ctx: PipelineContext,
    pub messenger: Arc<RecordingMessenger>,
    pub uploader: Arc<RecordingUploader>,
    pub engine: Arc<ScriptedEngine>,
    dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_engine(ScriptedEngine::push())
    }

    pub fn with_engine(engine: Arc<ScriptedEngine>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let messenger = Arc::new(RecordingMessenger::default());
        let uploader = Arc::new(RecordingUploader::default());
        let broadcaster = StatusBroadcaster::new(registry.clone(), messenger.clone(), SLOW_TICK);
        let harness_engine = engine.clone();
        let poller = EnginePoller::new(
            registry.clone(),
            Self::adapters_for(engine),
            Self::uploaders_for(uploader.clone()),
            SLOW_TICK,
        );
        let ctx = PipelineContext {
            registry,
            archiver: Arc::new(LocalArchiver::new("extract")),
            messenger: messenger.clone(),
            broadcaster,
            poller,
            index_url: None,
        };
        Self {
            ctx,
            messenger,
            uploader,
            engine: harness_engine,
            dir,
        }
    }

    fn adapters_for(
        engine: Arc<ScriptedEngine>,
    ) -> HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>> {
        let mut adapters: HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>> = HashMap::new();
        adapters.insert(EngineKind::Aria2, engine);
        adapters
    }

    fn uploaders_for(
        uploader: Arc<RecordingUploader>,
    ) -> HashMap<UploadTarget, Arc<dyn UploadAdapter>> {
        let mut uploaders: HashMap<UploadTarget, Arc<dyn UploadAdapter>> = HashMap::new();
        uploaders.insert(UploadTarget::Drive, uploader);
        uploaders
    }

    pub fn download_root(&self) -> &Path {
        self.dir.path()
    }

    pub fn dest_dir(&self, uid: &str) -> PathBuf {
        self.dir.path().join(uid)
    }

    /// Registers a job directly, bypassing the manager and any engine.
    pub fn spawn_job(&self, uid: &str, options: PipelineOptions) -> ListenerHandle {
        let uid = JobId::from_raw(uid);
        let upload_target = options.upload_target;
        let listener = JobListener::spawn(
            uid.clone(),
            options,
            self.uploader.clone(),
            self.ctx.clone(),
        );
        let record = StatusRecord::new(
            uid.clone(),
            EngineKind::Aria2,
            upload_target,
            self.dest_dir(uid.as_str()),
            origin(),
            listener.clone(),
        );
        self.ctx.registry.put(record).unwrap();
        listener
    }

    pub fn manager(&self) -> JobManager {
        JobManager::new(
            self.ctx.clone(),
            Self::adapters_for(self.engine.clone()),
            Self::uploaders_for(self.uploader.clone()),
            self.dir.path().to_path_buf(),
        )
    }
}
