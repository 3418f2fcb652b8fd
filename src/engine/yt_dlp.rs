//! yt-dlp subprocess engine. Pushes its own events; progress comes from the
//! `--newline` progress lines on stdout.

use super::{AddOptions, DownloadEngineAdapter, EngineState, EngineStatus, NotificationMode};
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{safe_file_name, EngineHandle, EngineKind, Source, TransferMetrics};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use std::{
    collections::VecDeque,
    env,
    path::Path,
    process::Stdio,
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, Instrument};

const STDERR_TAIL: usize = 5;

static PROGRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^\[download\]\s+(?P<pct>[\d.]+)%\s+of\s+~?\s*(?P<total>[\d.]+)(?P<unit>[KMGT]?i?B)",
        r"(?:\s+at\s+(?P<speed>[\d.]+)(?P<sunit>[KMGT]?i?B)/s)?",
        r"(?:\s+ETA\s+(?P<eta>[\d:]+))?",
    ))
    .unwrap()
});

static DESTINATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"^\[(?:download|Merger|ExtractAudio)\]\s+"#,
        r#"(?:Destination:\s+|Merging formats into\s+")(?P<path>.+?)"?$"#,
    ))
    .unwrap()
});

#[derive(Debug, Default)]
struct Progress {
    name: Option<String>,
    metrics: TransferMetrics,
    state: Option<EngineState>,
}

struct Transfer {
    progress: Arc<Mutex<Progress>>,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct YtDlpDownloader {
    transfers: Arc<DashMap<EngineHandle, Transfer>>,
}

impl YtDlpDownloader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadEngineAdapter for YtDlpDownloader {
    fn kind(&self) -> EngineKind {
        EngineKind::Media
    }

    fn notification_mode(&self) -> NotificationMode {
        NotificationMode::Push
    }

    #[instrument(skip(self, listener), fields(dir = %dest_dir.display()))]
    async fn add_download(
        &self,
        source: &Source,
        dest_dir: &Path,
        options: &AddOptions,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        let Source::Media { url, format } = source else {
            return Err(EngineError::InvalidSource(source.describe().to_string()));
        };
        tokio::fs::create_dir_all(dest_dir).await?;
        let template = match options.custom_name.as_deref().and_then(safe_file_name) {
            Some(name) => format!("{}.%(ext)s", name.replace('%', "%%")),
            None => "%(title)s.%(ext)s".to_string(),
        };

        let mut cmd = yt_dlp_base_command();
        if let Some(format) = format {
            cmd.arg("-f").arg(format);
        }
        let mut child = cmd
            .arg("-o")
            .arg(dest_dir.join(template))
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--progress")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Io("yt-dlp stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Io("yt-dlp stderr unavailable".into()))?;

        let handle = EngineHandle::generate();
        let progress = Arc::new(Mutex::new(Progress::default()));
        let cancel = CancellationToken::new();
        self.transfers.insert(
            handle.clone(),
            Transfer {
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(event = "yt_dlp_spawned", handle = %handle, url = %url);

        let transfers = self.transfers.clone();
        let task_handle = handle.clone();
        tokio::spawn(
            async move {
                let stderr_task = tokio::spawn(
                    async move {
                        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            trace!(event = "yt_dlp_stderr_line", line = line.as_str());
                            if tail.len() == STDERR_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        tail
                    }
                    .in_current_span(),
                );

                listener.on_download_started();
                let mut lines = BufReader::new(stdout).lines();
                let cancelled = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break true,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                if apply_line(&progress, &line) {
                                    listener.on_download_progress();
                                }
                            }
                            _ => break false,
                        },
                    }
                };

                if cancelled {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    transfers.remove(&task_handle);
                    info!(event = "yt_dlp_cancelled", handle = %task_handle);
                    listener.on_download_error(&EngineError::Cancelled.to_string());
                    return;
                }

                let status = child.wait().await;
                let tail = stderr_task.await.unwrap_or_default();
                transfers.remove(&task_handle);
                match status {
                    Ok(status) if status.success() => {
                        progress.lock().state = Some(EngineState::Complete);
                        info!(event = "yt_dlp_complete", handle = %task_handle);
                        listener.on_download_complete();
                    }
                    Ok(status) => {
                        let reason = tail
                            .iter()
                            .rev()
                            .find(|line| line.contains("ERROR"))
                            .cloned()
                            .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
                        error!(event = "yt_dlp_failed", handle = %task_handle, status = %status);
                        listener.on_download_error(&reason);
                    }
                    Err(err) => {
                        error!(event = "yt_dlp_wait_failed", handle = %task_handle, error = %err);
                        listener.on_download_error(&err.to_string());
                    }
                }
            }
            .in_current_span(),
        );
        Ok(handle)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let transfer = self
            .transfers
            .get(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        transfer.cancel.cancel();
        debug!(event = "yt_dlp_cancel_requested", handle = %handle);
        Ok(())
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.cancel(handle).await
    }

    async fn query_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        let progress = self
            .transfers
            .get(handle)
            .map(|t| t.progress.clone())
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        let progress = progress.lock();
        Ok(EngineStatus {
            name: progress.name.clone(),
            metrics: progress.metrics.clone(),
            ..EngineStatus::new(progress.state.unwrap_or(EngineState::Active))
        })
    }
}

/// Returns `true` when the line carried new transfer metrics.
fn apply_line(progress: &Mutex<Progress>, line: &str) -> bool {
    if let Some(name) = parse_destination(line) {
        progress.lock().name = Some(name);
        false
    } else if let Some(metrics) = parse_progress_line(line) {
        progress.lock().metrics = metrics;
        true
    } else {
        false
    }
}

pub(crate) fn parse_destination(line: &str) -> Option<String> {
    let caps = DESTINATION_REGEX.captures(line.trim())?;
    Path::new(&caps["path"])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

pub(crate) fn parse_progress_line(line: &str) -> Option<TransferMetrics> {
    let caps = PROGRESS_REGEX.captures(line.trim())?;
    let percent: f64 = caps["pct"].parse().ok()?;
    let total = to_bytes(caps["total"].parse().ok()?, &caps["unit"]);
    let speed = match (caps.name("speed"), caps.name("sunit")) {
        (Some(value), Some(unit)) => to_bytes(value.as_str().parse().ok()?, unit.as_str()),
        _ => 0,
    };
    Some(TransferMetrics {
        total_bytes: total,
        processed_bytes: (total as f64 * percent / 100.0) as u64,
        speed_bps: speed,
        eta: caps.name("eta").and_then(|eta| parse_clock(eta.as_str())),
    })
}

fn to_bytes(value: f64, unit: &str) -> u64 {
    let factor: f64 = match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => 1.0,
    };
    (value * factor) as u64
}

fn parse_clock(text: &str) -> Option<Duration> {
    text.split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
        .map(Duration::from_secs)
}

fn yt_dlp_base_command() -> Command {
    let mut cmd = Command::new("yt-dlp");
    let player_client = env::var("YTDLP_PLAYER_CLIENT").unwrap_or_else(|_| "android".to_string());
    cmd.arg("--extractor-args")
        .arg(format!("youtube:player_client={player_client}"));

    if matches!(
        env::var("YTDLP_FORCE_IPV4").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    ) {
        info!(event = "yt_dlp_force_ipv4");
        cmd.arg("--force-ipv4");
    }
    cmd
}
