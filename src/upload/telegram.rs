use super::{ActiveUploads, UploadProgress, UPLOAD_CANCELLED};
use crate::engine::{EngineStatus, UploadAdapter};
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{EngineHandle, Origin, UploadTarget};
use async_trait::async_trait;
use rand::Rng;
use std::{path::Path, sync::Arc, time::Duration};
use teloxide::{
    prelude::*,
    types::{InputFile, MessageId, ReplyParameters},
    RequestError,
};
use tokio::{io::AsyncRead, time};
use tokio_util::io::InspectReader;
use tracing::{error, info, instrument, warn, Instrument};

const UPLOAD_MAX_RETRIES: usize = 3;
const UPLOAD_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const UPLOAD_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

pub struct TelegramUploader {
    bot: Bot,
    uploads: ActiveUploads,
}

impl TelegramUploader {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            uploads: ActiveUploads::default(),
        }
    }
}

#[async_trait]
impl UploadAdapter for TelegramUploader {
    fn target(&self) -> UploadTarget {
        UploadTarget::Telegram
    }

    fn accepts_directories(&self) -> bool {
        false
    }

    #[instrument(
        skip(self, origin, listener),
        fields(path = %path.display(), chat = origin.chat_id.0)
    )]
    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
        origin: &Origin,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.is_dir() {
            return Err(EngineError::InvalidSource(
                "Cannot upload directories to Telegram".into(),
            ));
        }
        let (handle, progress, cancel) = self.uploads.begin(display_name, metadata.len());
        info!(event = "telegram_upload_started", handle = %handle, size = metadata.len());

        let bot = self.bot.clone();
        let uploads = self.uploads.clone();
        let path = path.to_path_buf();
        let name = display_name.to_string();
        let chat_id = origin.chat_id;
        let reply_to = origin.message_id;
        let task_handle = handle.clone();
        tokio::spawn(
            async move {
                listener.on_upload_started();
                let send =
                    send_document_with_retry(&bot, chat_id, reply_to, &path, &name, &progress);
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = send => Some(result),
                };
                uploads.end(&task_handle);
                match result {
                    Some(Ok(())) => {
                        progress.finish();
                        info!(event = "telegram_upload_complete", handle = %task_handle);
                        listener.on_upload_complete("");
                    }
                    Some(Err(err)) => {
                        error!(
                            event = "telegram_upload_failed",
                            handle = %task_handle,
                            error = %err
                        );
                        listener.on_upload_error(&err.to_string());
                    }
                    None => {
                        info!(event = "telegram_upload_cancelled", handle = %task_handle);
                        listener.on_upload_error(UPLOAD_CANCELLED);
                    }
                }
            }
            .in_current_span(),
        );
        Ok(handle)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.uploads.cancel(handle)
    }

    fn query_status(&self, handle: &EngineHandle) -> Option<EngineStatus> {
        self.uploads.status(handle)
    }
}

async fn send_document_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    path: &Path,
    name: &str,
    progress: &Arc<UploadProgress>,
) -> Result<(), RequestError> {
    let mut attempt = 1;
    loop {
        progress.restart();
        let file = tokio::fs::File::open(path).await.map_err(Arc::new)?;
        let document =
            InputFile::read(counted(file, progress.clone())).file_name(name.to_string());
        match bot
            .send_document(chat_id, document)
            .reply_parameters(ReplyParameters::new(reply_to).allow_sending_without_reply())
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => {
                let Some(delay) = retry_delay_for_upload(&err, attempt) else {
                    return Err(err);
                };
                if attempt == UPLOAD_MAX_RETRIES {
                    return Err(err);
                }
                warn!(event = "upload_retry", attempt, ?delay, error = %err);
                time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn counted<R>(reader: R, progress: Arc<UploadProgress>) -> impl AsyncRead + Send + Unpin + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    InspectReader::new(reader, move |chunk: &[u8]| progress.add(chunk.len() as u64))
}

fn retry_delay_for_upload(err: &RequestError, attempt: usize) -> Option<Duration> {
    match err {
        RequestError::RetryAfter(delay) => Some(delay.duration()),
        RequestError::Network(net) if net.is_timeout() || net.is_connect() => {
            let base_ms = UPLOAD_RETRY_BASE_DELAY.as_millis() as u64;
            let factor = 1u64 << (attempt - 1).min(16);
            let max_ms = UPLOAD_RETRY_MAX_DELAY.as_millis() as u64;
            let delay_ms = base_ms.saturating_mul(factor).min(max_ms);
            let jitter_ms = rand::thread_rng().gen_range(0..=500);
            Some(Duration::from_millis(delay_ms + jitter_ms))
        }
        _ => None,
    }
}
