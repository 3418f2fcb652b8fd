use crate::engine::mega::is_mega_link;
use crate::error::AppError;
use crate::manager::{JobManager, JobRequest};
use crate::messages::{auto_delete, Messenger};
use crate::status::{escape_html, StatusBroadcaster, NO_ACTIVE_DOWNLOADS};
use crate::tasks::{
    is_magnet, is_url, EngineHandle, EngineKind, JobId, Origin, PipelineOptions, Source,
    StatusRecord, UploadTarget,
};
use std::{sync::Arc, time::Duration};
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{FileId, User},
    utils::command::BotCommands,
};
use tracing::{info, instrument, warn};

const TORRENT_MIME: &str = "application/x-bittorrent";

const WATCH_USAGE: &str = "/watch [yt-dlp supported link] [quality] to mirror with yt-dlp.\n\n\
Example of quality: audio, 144, 360, 720, 1080.\nNote: quality is optional";

const RENAME_USAGE: &str = "Usage: <code>/rename [gid] [new name]</code>, \
or reply to the mirror message with <code>/rename [new name]</code>";

const START_MESSAGE: &str = "This bot can mirror links, torrents, MEGA and Telegram files \
to Google Drive or back into Telegram.\nType /help to get a list of available commands";

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "[link|magnet] or reply to a file: mirror it to Google Drive")]
    Mirror(String),
    #[command(description = "[link|magnet]: mirror and upload a .tar of the download")]
    TarMirror(String),
    #[command(description = "[link|magnet]: mirror and extract archives before uploading")]
    UnzipMirror(String),
    #[command(description = "[link|magnet] or reply to a file: upload it back to Telegram")]
    Leech(String),
    #[command(description = "[link] [quality]: mirror through yt-dlp")]
    Watch(String),
    #[command(description = "[link]: mirror a hoster link through JDownloader")]
    Jdl(String),
    #[command(description = "show the status of all downloads")]
    Status,
    #[command(description = "[gid] or reply to the mirror message: cancel that download")]
    Cancel(String),
    #[command(description = "cancel every active download")]
    CancelAll,
    #[command(description = "[gid] [name] or reply with [name]: upload a torrent under a new name")]
    Rename(String),
    #[command(description = "list torrents that can still be renamed")]
    ListTorrents,
    #[command(description = "greet")]
    Start,
    #[command(description = "show this message")]
    Help,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MirrorMode {
    Mirror,
    Tar,
    Unzip,
    Leech,
}

impl MirrorMode {
    fn options(self, custom_name: Option<String>, tag: Option<String>) -> PipelineOptions {
        PipelineOptions {
            archive: self == MirrorMode::Tar,
            extract: self == MirrorMode::Unzip,
            upload_target: if self == MirrorMode::Leech {
                UploadTarget::Telegram
            } else {
                UploadTarget::Drive
            },
            custom_name,
            tag,
        }
    }
}

#[derive(Clone)]
pub struct AppServices {
    manager: JobManager,
    broadcaster: Arc<StatusBroadcaster>,
    messenger: Arc<dyn Messenger>,
    auto_delete: Option<Duration>,
}

impl AppServices {
    pub fn new(manager: JobManager, auto_delete: Option<Duration>) -> Self {
        let ctx = manager.context();
        Self {
            broadcaster: ctx.broadcaster.clone(),
            messenger: ctx.messenger.clone(),
            manager,
            auto_delete,
        }
    }

    /// Replies to the command and removes both messages after the configured
    /// delay.
    async fn notify(&self, msg: &Message, text: impl Into<String>) -> Result<(), AppError> {
        let reply = self.messenger.reply(msg.chat.id, msg.id, text.into()).await?;
        auto_delete(
            self.messenger.clone(),
            msg.chat.id,
            vec![msg.id, reply],
            self.auto_delete,
        );
        Ok(())
    }

    async fn submit(
        &self,
        msg: &Message,
        source: Source,
        engine: EngineKind,
        options: PipelineOptions,
    ) -> Result<(), AppError> {
        let request = JobRequest {
            uid: JobId::from_message(msg.chat.id, msg.id),
            source,
            engine,
            options,
            origin: Origin {
                chat_id: msg.chat.id,
                message_id: msg.id,
                mention: mention(msg.from.as_ref()),
            },
        };
        match self.manager.create_job(request).await {
            Ok(uid) => {
                info!(event = "job_accepted", uid = %uid, engine = engine.label());
                self.broadcaster.send_status_message(msg.chat.id, msg.id).await?;
                Ok(())
            }
            Err(err) => {
                warn!(event = "job_rejected", engine = engine.label(), error = %err);
                self.notify(msg, escape_html(&err.to_string())).await
            }
        }
    }
}

pub fn build_handler(
) -> Handler<'static, Result<(), AppError>, DpHandlerDescription> {
    Update::filter_message()
        .filter_command::<Command>()
        .endpoint(handle_command)
}

#[instrument(skip(bot, services, msg), fields(chat = msg.chat.id.0, message = msg.id.0))]
async fn handle_command(
    bot: Bot,
    services: AppServices,
    msg: Message,
    cmd: Command,
) -> Result<(), AppError> {
    match cmd {
        Command::Mirror(args) => mirror(&bot, &services, &msg, &args, MirrorMode::Mirror).await,
        Command::TarMirror(args) => mirror(&bot, &services, &msg, &args, MirrorMode::Tar).await,
        Command::UnzipMirror(args) => mirror(&bot, &services, &msg, &args, MirrorMode::Unzip).await,
        Command::Leech(args) => mirror(&bot, &services, &msg, &args, MirrorMode::Leech).await,
        Command::Watch(args) => watch(&services, &msg, &args).await,
        Command::Jdl(args) => jdownloader(&services, &msg, &args).await,
        Command::Status => status(&services, &msg).await,
        Command::Cancel(args) => cancel(&services, &msg, &args).await,
        Command::CancelAll => {
            let cancelled = services.manager.cancel_all().await;
            if cancelled == 0 {
                services.notify(&msg, NO_ACTIVE_DOWNLOADS).await
            } else {
                services.notify(&msg, "Cancelled all downloads!").await
            }
        }
        Command::Rename(args) => rename(&services, &msg, &args).await,
        Command::ListTorrents => {
            let text = render_torrents(&services.manager.torrent_jobs());
            services.notify(&msg, text).await
        }
        Command::Start => {
            services.messenger.reply(msg.chat.id, msg.id, START_MESSAGE.to_string()).await?;
            Ok(())
        }
        Command::Help => {
            let text = escape_html(&Command::descriptions().to_string());
            services.messenger.reply(msg.chat.id, msg.id, text).await?;
            Ok(())
        }
    }
}

async fn mirror(
    bot: &Bot,
    services: &AppServices,
    msg: &Message,
    args: &str,
    mode: MirrorMode,
) -> Result<(), AppError> {
    let (mut link, custom_name) = split_link_and_name(args);
    let reply = msg.reply_to_message();
    let tag = reply
        .and_then(|r| r.from.as_ref())
        .and_then(|u| u.username.clone());
    let options = mode.options(custom_name, tag);
    if !services.manager.supports_upload(options.upload_target) {
        return services
            .notify(msg, "Google Drive is not configured, use /leech instead")
            .await;
    }

    if link.is_empty() {
        if let Some(media) = reply.and_then(replied_media) {
            if !media.torrent {
                let source = Source::TelegramFile {
                    file_id: media.file_id,
                    file_name: media.file_name,
                    size: media.size,
                };
                return services
                    .submit(msg, source, EngineKind::Telegram, options)
                    .await;
            }
            let file = bot.get_file(FileId(media.file_id)).await?;
            link = telegram_file_url(bot.api_url().as_str(), bot.token(), &file.path);
        }
    }

    if !is_url(&link) && !is_magnet(&link) {
        return services.notify(msg, "No download source provided").await;
    }
    let engine = pick_engine(&link, services.manager.supports(EngineKind::Mega));
    services
        .submit(msg, Source::from_link(&link), engine, options)
        .await
}

async fn watch(services: &AppServices, msg: &Message, args: &str) -> Result<(), AppError> {
    let mut parts = args.split_whitespace();
    let Some(link) = parts.next() else {
        return services.notify(msg, WATCH_USAGE).await;
    };
    let tag = msg
        .reply_to_message()
        .and_then(|r| r.from.as_ref())
        .and_then(|u| u.username.clone());
    let source = Source::Media {
        url: link.to_string(),
        format: Some(watch_format(parts.next())),
    };
    services
        .submit(msg, source, EngineKind::Media, MirrorMode::Mirror.options(None, tag))
        .await
}

async fn jdownloader(services: &AppServices, msg: &Message, args: &str) -> Result<(), AppError> {
    if !services.manager.supports(EngineKind::JDownloader) {
        return services.notify(msg, "JDownloader is not configured").await;
    }
    let (link, custom_name) = split_link_and_name(args);
    if !is_url(&link) {
        return services.notify(msg, "Please provide a link for JDownloader").await;
    }
    let engine = if is_mega_link(&link) {
        EngineKind::Mega
    } else {
        EngineKind::JDownloader
    };
    services
        .submit(
            msg,
            Source::Uri(link),
            engine,
            MirrorMode::Mirror.options(custom_name, None),
        )
        .await
}

async fn status(services: &AppServices, msg: &Message) -> Result<(), AppError> {
    if services.manager.is_idle() {
        return services.notify(msg, NO_ACTIVE_DOWNLOADS).await;
    }
    services
        .broadcaster
        .send_status_message(msg.chat.id, msg.id)
        .await?;
    if let Err(err) = services.messenger.delete(msg.chat.id, msg.id).await {
        warn!(event = "command_delete_failed", error = %err);
    }
    Ok(())
}

async fn cancel(services: &AppServices, msg: &Message, args: &str) -> Result<(), AppError> {
    let gid = args.trim();
    let uid = if !gid.is_empty() {
        match services
            .manager
            .find_job_by_handle(&EngineHandle::from_raw(gid))
        {
            Some(record) => record.uid,
            None => {
                let text = format!("GID: <code>{}</code> not found.", escape_html(gid));
                return services.notify(msg, text).await;
            }
        }
    } else if let Some(reply) = msg.reply_to_message() {
        JobId::from_message(msg.chat.id, reply.id)
    } else {
        return services
            .notify(
                msg,
                "Reply to the message by which the download was initiated, or pass its GID",
            )
            .await;
    };

    match services.manager.cancel_job(&uid).await {
        Ok(()) => Ok(()),
        Err(AppError::JobNotFound(_)) => services.notify(msg, "This is not an active task!").await,
        Err(err) => Err(err),
    }
}

async fn rename(services: &AppServices, msg: &Message, args: &str) -> Result<(), AppError> {
    let args = args.trim();
    if args.is_empty() {
        let text = format!(
            "{}\n\n{RENAME_USAGE}",
            render_torrents(&services.manager.torrent_jobs())
        );
        return services.notify(msg, text).await;
    }
    let (uid, name) = if let Some(reply) = msg.reply_to_message() {
        (JobId::from_message(msg.chat.id, reply.id), args)
    } else {
        let Some((gid, name)) = args.split_once(char::is_whitespace) else {
            return services.notify(msg, RENAME_USAGE).await;
        };
        match services
            .manager
            .find_job_by_handle(&EngineHandle::from_raw(gid))
        {
            Some(record) => (record.uid, name.trim()),
            None => {
                let text = format!("GID: <code>{}</code> not found.", escape_html(gid));
                return services.notify(msg, text).await;
            }
        }
    };

    match services.manager.rename_job(&uid, name) {
        Ok(previous) => {
            let text = format!(
                "Renamed <code>{}</code> to <code>{}</code>",
                escape_html(&previous),
                escape_html(name)
            );
            services.notify(msg, text).await
        }
        Err(AppError::JobNotFound(_)) => services.notify(msg, "This is not an active task!").await,
        Err(err @ (AppError::InvalidName(_) | AppError::RenameRefused(_))) => {
            services.notify(msg, escape_html(&err.to_string())).await
        }
        Err(err) => Err(err),
    }
}

fn render_torrents(records: &[StatusRecord]) -> String {
    if records.is_empty() {
        return "No active torrent downloads found.".to_string();
    }
    let mut text = String::from("<b>Active torrent downloads:</b>\n");
    for (i, record) in records.iter().enumerate() {
        let gid = record.handle.as_ref().map(|h| h.as_str()).unwrap_or_default();
        text.push_str(&format!(
            "\n<b>{}.</b> {}\nGID: <code>{}</code>\nStatus: {}\n",
            i + 1,
            escape_html(record.display_name()),
            escape_html(gid),
            record.stage.label()
        ));
    }
    text
}

struct RepliedMedia {
    file_id: String,
    file_name: Option<String>,
    size: u64,
    torrent: bool,
}

fn replied_media(reply: &Message) -> Option<RepliedMedia> {
    if let Some(doc) = reply.document() {
        let torrent = doc
            .mime_type
            .as_ref()
            .is_some_and(|mime| mime.essence_str() == TORRENT_MIME);
        return Some(RepliedMedia {
            file_id: doc.file.id.0.clone(),
            file_name: doc.file_name.clone(),
            size: u64::from(doc.file.size),
            torrent,
        });
    }
    if let Some(video) = reply.video() {
        return Some(RepliedMedia {
            file_id: video.file.id.0.clone(),
            file_name: video.file_name.clone(),
            size: u64::from(video.file.size),
            torrent: false,
        });
    }
    reply.audio().map(|audio| RepliedMedia {
        file_id: audio.file.id.0.clone(),
        file_name: audio.file_name.clone(),
        size: u64::from(audio.file.size),
        torrent: false,
    })
}

/// `<link> | <custom name>`; both parts trimmed, an empty name is none.
fn split_link_and_name(args: &str) -> (String, Option<String>) {
    let (link, name) = match args.split_once('|') {
        Some((link, name)) => (link, Some(name.trim())),
        None => (args, None),
    };
    let link = link.split_whitespace().next().unwrap_or_default().to_string();
    let name = name.filter(|n| !n.is_empty()).map(str::to_string);
    (link, name)
}

fn watch_format(quality: Option<&str>) -> String {
    match quality {
        None => "best/bestvideo+bestaudio".to_string(),
        Some("audio") => "bestaudio".to_string(),
        Some(height) => format!("best[height<={height}]/bestvideo[height<={height}]+bestaudio"),
    }
}

fn pick_engine(link: &str, mega_available: bool) -> EngineKind {
    if mega_available && is_mega_link(link) {
        EngineKind::Mega
    } else {
        EngineKind::Aria2
    }
}

fn mention(user: Option<&User>) -> String {
    match user {
        Some(User {
            username: Some(username),
            ..
        }) => format!("@{username}"),
        Some(user) => format!(
            "<a href=\"tg://user?id={}\">{}</a>",
            user.id,
            escape_html(&user.first_name)
        ),
        None => String::new(),
    }
}

fn telegram_file_url(api_url: &str, token: &str, path: &str) -> String {
    format!("{}/file/bot{token}/{path}", api_url.trim_end_matches('/'))
}
