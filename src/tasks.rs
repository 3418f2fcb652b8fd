use crate::listener::ListenerHandle;
use rand::{distributions::Alphanumeric, Rng};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use teloxide::types::{ChatId, MessageId};

/// Per-job identifier, derived from the command message that created the job.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn from_message(chat_id: ChatId, message_id: MessageId) -> Self {
        Self(format!("{}_{}", chat_id.0, message_id.0))
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier assigned by a backing engine (aria2 gid, JDownloader package id, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngineHandle(String);

impl EngineHandle {
    /// Mints a handle for engines that have no id of their own.
    pub fn generate() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Aria2,
    Mega,
    JDownloader,
    Telegram,
    Media,
}

impl EngineKind {
    pub fn label(self) -> &'static str {
        match self {
            EngineKind::Aria2 => "aria2",
            EngineKind::Mega => "MEGA",
            EngineKind::JDownloader => "JDownloader",
            EngineKind::Telegram => "Telegram",
            EngineKind::Media => "yt-dlp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadTarget {
    Drive,
    Telegram,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Uri(String),
    Magnet(String),
    TelegramFile {
        file_id: String,
        file_name: Option<String>,
        size: u64,
    },
    Media {
        url: String,
        format: Option<String>,
    },
}

impl Source {
    pub fn from_link(link: &str) -> Self {
        if is_magnet(link) {
            Source::Magnet(link.to_string())
        } else {
            Source::Uri(link.to_string())
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            Source::Uri(uri) | Source::Magnet(uri) => uri,
            Source::TelegramFile { file_id, .. } => file_id,
            Source::Media { url, .. } => url,
        }
    }
}

pub fn is_magnet(link: &str) -> bool {
    link.starts_with("magnet:?")
}

pub fn is_url(link: &str) -> bool {
    url::Url::parse(link)
        .map(|url| matches!(url.scheme(), "http" | "https" | "ftp"))
        .unwrap_or(false)
}

/// Accepts `name` only if it is a single, plain path component.
pub fn safe_file_name(name: &str) -> Option<String> {
    const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let name = name.trim();
    if name.is_empty()
        || name.chars().any(|c| RESERVED.contains(&c) || c.is_control())
    {
        return None;
    }
    let component = Path::new(name).file_name()?;
    (component == name).then(|| name.to_string())
}

/// Last component of a peer-supplied path, if that component is safe.
pub fn base_file_name(path: &str) -> Option<String> {
    let base = path.rsplit(['/', '\\']).next()?;
    safe_file_name(base)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    pub archive: bool,
    pub extract: bool,
    pub upload_target: UploadTarget,
    pub custom_name: Option<String>,
    pub tag: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            archive: false,
            extract: false,
            upload_target: UploadTarget::Drive,
            custom_name: None,
            tag: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Origin {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub mention: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskOutcome {
    Success,
    Failed(String),
    Cancelled,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    Waiting,
    Downloading,
    Archiving,
    Extracting,
    Uploading,
    Terminal(TaskOutcome),
}

impl Stage {
    pub fn is_downloading(&self) -> bool {
        matches!(self, Stage::Waiting | Stage::Downloading)
    }

    pub fn is_post_download(&self) -> bool {
        matches!(self, Stage::Archiving | Stage::Extracting | Stage::Uploading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Terminal(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Waiting => "Waiting...",
            Stage::Downloading => "Downloading...",
            Stage::Archiving => "Archiving...",
            Stage::Extracting => "Extracting...",
            Stage::Uploading => "Uploading...",
            Stage::Terminal(TaskOutcome::Success) => "Done",
            Stage::Terminal(TaskOutcome::Failed(_)) => "Failed",
            Stage::Terminal(TaskOutcome::Cancelled) => "Cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobFlags {
    pub archiving: bool,
    pub extracting: bool,
    pub torrent: bool,
    pub cancelled_by_user: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferMetrics {
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub speed_bps: u64,
    pub eta: Option<Duration>,
}

impl TransferMetrics {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.processed_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatusRecord {
    pub uid: JobId,
    pub stage: Stage,
    pub name: Option<String>,
    /// Name the download is moved to before post-processing.
    pub rename_to: Option<String>,
    pub metrics: TransferMetrics,
    pub engine: EngineKind,
    pub handle: Option<EngineHandle>,
    pub upload_target: UploadTarget,
    pub dest_dir: PathBuf,
    pub origin: Origin,
    pub flags: JobFlags,
    pub listener: ListenerHandle,
}

impl StatusRecord {
    pub fn new(
        uid: JobId,
        engine: EngineKind,
        upload_target: UploadTarget,
        dest_dir: PathBuf,
        origin: Origin,
        listener: ListenerHandle,
    ) -> Self {
        Self {
            uid,
            stage: Stage::Waiting,
            name: None,
            rename_to: None,
            metrics: TransferMetrics::default(),
            engine,
            handle: None,
            upload_target,
            dest_dir,
            origin,
            flags: JobFlags::default(),
            listener,
        }
    }

    pub fn display_name(&self) -> &str {
        self.rename_to
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_else(|| self.uid.as_str())
    }
}
