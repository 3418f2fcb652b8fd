use super::{
    estimate_eta, AddOptions, DownloadEngineAdapter, EngineState, EngineStatus, NotificationMode,
};
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{
    base_file_name, safe_file_name, EngineHandle, EngineKind, Source, TransferMetrics,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::{path::Path, sync::Arc, time::Instant};
use teloxide::{net::Download, prelude::*, types::FileId};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};

#[derive(Debug)]
struct Progress {
    name: String,
    total: u64,
    done: u64,
    started: Instant,
}

impl Progress {
    fn metrics(&self) -> TransferMetrics {
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-3);
        let speed = (self.done as f64 / elapsed) as u64;
        TransferMetrics {
            total_bytes: self.total,
            processed_bytes: self.done,
            speed_bps: speed,
            eta: estimate_eta(self.total, self.done, speed),
        }
    }
}

struct Transfer {
    progress: Arc<Mutex<Progress>>,
    cancel: CancellationToken,
}

pub struct TelegramDownloader {
    bot: Bot,
    transfers: Arc<DashMap<EngineHandle, Transfer>>,
}

impl TelegramDownloader {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            transfers: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl DownloadEngineAdapter for TelegramDownloader {
    fn kind(&self) -> EngineKind {
        EngineKind::Telegram
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
        let Source::TelegramFile {
            file_id,
            file_name,
            size,
        } = source
        else {
            return Err(EngineError::InvalidSource(source.describe().to_string()));
        };
        let file = self
            .bot
            .get_file(FileId(file_id.clone()))
            .await
            .map_err(|err| EngineError::Unreachable(err.to_string()))?;
        let name = options
            .custom_name
            .as_deref()
            .and_then(safe_file_name)
            .or_else(|| file_name.as_deref().and_then(base_file_name))
            .or_else(|| base_file_name(&file.path))
            .unwrap_or_else(|| file_id.clone());
        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(&name);
        let mut output = tokio::fs::File::create(&target).await?;

        let handle = EngineHandle::generate();
        let progress = Arc::new(Mutex::new(Progress {
            name,
            total: if *size > 0 { *size } else { u64::from(file.size) },
            done: 0,
            started: Instant::now(),
        }));
        let cancel = CancellationToken::new();
        self.transfers.insert(
            handle.clone(),
            Transfer {
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(event = "telegram_download_started", handle = %handle, path = %target.display());

        let bot = self.bot.clone();
        let transfers = self.transfers.clone();
        let task_handle = handle.clone();
        tokio::spawn(
            async move {
                listener.on_download_started();
                let mut stream = bot.download_file_stream(&file.path);
                let result: Result<bool, EngineError> = async {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(true),
                            chunk = stream.next() => match chunk {
                                Some(chunk) => {
                                    let chunk = chunk
                                        .map_err(|e| EngineError::Unreachable(e.to_string()))?;
                                    output.write_all(&chunk).await?;
                                    progress.lock().done += chunk.len() as u64;
                                }
                                None => {
                                    output.flush().await?;
                                    return Ok(false);
                                }
                            },
                        }
                    }
                }
                .await;
                transfers.remove(&task_handle);
                match result {
                    Ok(false) => {
                        info!(event = "telegram_download_complete", handle = %task_handle);
                        listener.on_download_complete();
                    }
                    Ok(true) => {
                        debug!(event = "telegram_download_cancelled", handle = %task_handle);
                        listener.on_download_error(&EngineError::Cancelled.to_string());
                    }
                    Err(err) => {
                        error!(
                            event = "telegram_download_failed",
                            handle = %task_handle,
                            error = %err
                        );
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
            name: Some(progress.name.clone()),
            metrics: progress.metrics(),
            ..EngineStatus::new(EngineState::Active)
        })
    }
}
