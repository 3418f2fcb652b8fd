use crate::error::AppError;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use teloxide::{
    prelude::*,
    types::{LinkPreviewOptions, MessageId, ParseMode, ReplyParameters},
    ApiError, RequestError,
};
use tokio::time;
use tracing::{debug, warn};

/// Outgoing chat operations the orchestrator needs. Text is HTML.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn reply(
        &self,
        chat_id: ChatId,
        reply_to: MessageId,
        text: String,
    ) -> Result<MessageId, AppError>;

    async fn edit(&self, chat_id: ChatId, message_id: MessageId, text: String)
        -> Result<(), AppError>;

    async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn no_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn reply(
        &self,
        chat_id: ChatId,
        reply_to: MessageId,
        text: String,
    ) -> Result<MessageId, AppError> {
        let sent = self
            .bot
            .send_message(chat_id, text)
            .parse_mode(ParseMode::Html)
            .link_preview_options(no_preview())
            .reply_parameters(ReplyParameters::new(reply_to).allow_sending_without_reply())
            .await?;
        Ok(sent.id)
    }

    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
    ) -> Result<(), AppError> {
        match self
            .bot
            .edit_message_text(chat_id, message_id, text)
            .parse_mode(ParseMode::Html)
            .link_preview_options(no_preview())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_message_not_modified(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), AppError> {
        match self.bot.delete_message(chat_id, message_id).await {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageToDeleteNotFound)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

/// Deletes the given messages after `after`; `None` keeps them forever.
pub fn auto_delete(
    messenger: Arc<dyn Messenger>,
    chat_id: ChatId,
    messages: Vec<MessageId>,
    after: Option<Duration>,
) {
    let Some(after) = after else {
        return;
    };
    tokio::spawn(async move {
        time::sleep(after).await;
        for message_id in messages {
            match messenger.delete(chat_id, message_id).await {
                Ok(()) => debug!(event = "auto_deleted", chat = chat_id.0, message = message_id.0),
                Err(err) => warn!(event = "auto_delete_failed", chat = chat_id.0, error = %err),
            }
        }
    });
}
