mod archive;
mod config;
mod engine;
mod error;
mod handlers;
mod listener;
mod manager;
mod messages;
mod poller;
mod registry;
mod schedule;
mod status;
mod tasks;
#[cfg(test)]
mod testing;
mod upload;

use crate::archive::LocalArchiver;
use crate::config::Config;
use crate::engine::{
    aria2::Aria2Adapter,
    jdownloader::{JDownloaderAdapter, JdClient},
    mega::MegaAdapter,
    telegram::TelegramDownloader,
    yt_dlp::YtDlpDownloader,
    DownloadEngineAdapter, UploadAdapter,
};
use crate::error::AppError;
use crate::listener::PipelineContext;
use crate::manager::JobManager;
use crate::messages::{Messenger, TelegramMessenger};
use crate::poller::EnginePoller;
use crate::registry::Registry;
use crate::status::StatusBroadcaster;
use crate::tasks::{EngineKind, UploadTarget};
use crate::upload::{drive::DriveUploader, telegram::TelegramUploader};
use handlers::{build_handler, AppServices};
use std::{collections::HashMap, sync::Arc, time::Duration};
use teloxide::{net::default_reqwest_settings, prelude::*};
use tracing::{error, info, warn, instrument, Instrument};
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "Application terminated with fatal error");
        return Err(err);
    }
    info!("Application shutdown complete");
    Ok(())
}

#[instrument]
async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Initializing mirror bot");
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| {
            error!(error = %e, "Failed to build HTTP client");
            e
        })?;
    // Engine RPC and Drive uploads must not inherit the bot's request timeout.
    let engine_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    info!("HTTP clients configured successfully");

    let bot = Bot::with_client(config.bot_token.clone(), client);
    info!("Telegram bot initialized");

    tokio::fs::create_dir_all(&config.download_dir).await?;

    let adapters = download_adapters(&config, &bot, &engine_client);
    let uploaders = upload_adapters(&config, &bot, &engine_client);
    info!(
        event = "engines_configured",
        engines = ?adapters.keys().map(|kind| kind.label()).collect::<Vec<_>>(),
        drive = uploaders.contains_key(&UploadTarget::Drive),
    );

    let registry = Registry::new();
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(bot.clone()));
    let broadcaster =
        StatusBroadcaster::new(registry.clone(), messenger.clone(), config.status_interval);
    let poller = EnginePoller::new(
        registry.clone(),
        adapters.clone(),
        uploaders.clone(),
        config.poll_interval,
    );
    let ctx = PipelineContext {
        registry,
        archiver: Arc::new(LocalArchiver::new(config.extract_command.clone())),
        messenger,
        broadcaster: broadcaster.clone(),
        poller: poller.clone(),
        index_url: config.index_url.clone(),
    };
    let manager = JobManager::new(ctx, adapters, uploaders, config.download_dir.clone())
        .with_setup_timeout(config.engine_setup_timeout);

    let handler = build_handler();
    let services = AppServices::new(manager.clone(), config.auto_delete);
    info!("Application services initialized");

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![services])
        .build();
    info!("Dispatcher built successfully");

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(
        async move {
            info!("Shutdown signal handler spawned");
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            if let Ok(wait) = shutdown_token.shutdown() {
                wait.await;
                info!("Graceful shutdown completed");
            } else {
                warn!("Failed to initiate graceful shutdown");
            }
        }
        .in_current_span(),
    );

    info!("Starting dispatcher event loop");
    dispatcher.dispatch().await;
    info!("Dispatcher stopped");

    if !manager.is_idle() {
        info!(event = "shutdown_with_active_jobs", status = %manager.snapshot_text());
    }
    let cancelled = manager.cancel_all().await;
    if cancelled > 0 {
        info!(event = "jobs_cancelled_on_shutdown", count = cancelled);
    }
    poller.stop();
    broadcaster.stop().await;
    Ok(())
}

fn download_adapters(
    config: &Config,
    bot: &Bot,
    client: &reqwest::Client,
) -> HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>> {
    let mut adapters: HashMap<EngineKind, Arc<dyn DownloadEngineAdapter>> = HashMap::new();
    adapters.insert(
        EngineKind::Aria2,
        Arc::new(Aria2Adapter::new(&config.aria2, client.clone())),
    );
    adapters.insert(EngineKind::Telegram, Arc::new(TelegramDownloader::new(bot.clone())));
    adapters.insert(EngineKind::Media, Arc::new(YtDlpDownloader::new()));
    if let Some(jd) = &config.jdownloader {
        let jd_client = Arc::new(JdClient::new(jd, client.clone()));
        adapters.insert(
            EngineKind::JDownloader,
            Arc::new(JDownloaderAdapter::new(jd_client.clone())),
        );
        adapters.insert(
            EngineKind::Mega,
            Arc::new(MegaAdapter::new(jd_client, config.mega.clone())),
        );
    }
    adapters
}

fn upload_adapters(
    config: &Config,
    bot: &Bot,
    client: &reqwest::Client,
) -> HashMap<UploadTarget, Arc<dyn UploadAdapter>> {
    let mut uploaders: HashMap<UploadTarget, Arc<dyn UploadAdapter>> = HashMap::new();
    uploaders.insert(UploadTarget::Telegram, Arc::new(TelegramUploader::new(bot.clone())));
    match &config.drive {
        Some(drive) => {
            uploaders.insert(
                UploadTarget::Drive,
                Arc::new(DriveUploader::new(drive, client.clone())),
            );
        }
        None => warn!(
            event = "drive_disabled",
            "GDRIVE_FOLDER_ID or GDRIVE_ACCESS_TOKEN missing, only /leech uploads are available"
        ),
    }
    uploaders
}

#[cfg(unix)]
#[instrument]
async fn shutdown_signal() {
    info!("Setting up signal handlers for graceful shutdown");
    let term = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    match (term, interrupt) {
        (Ok(mut term), Ok(mut interrupt)) => {
            info!("SIGTERM and SIGINT handlers registered successfully");
            tokio::select! {
                _ = term.recv() => {
                    info!("Received SIGTERM signal");
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT signal");
                }
            }
        }
        (Ok(mut term), Err(err)) => {
            warn!(error = %err, "Failed to register SIGINT handler, falling back to SIGTERM only");
            let _ = term.recv().await;
            info!("Received SIGTERM signal");
        }
        (Err(err), Ok(mut interrupt)) => {
            warn!(error = %err, "Failed to register SIGTERM handler, falling back to SIGINT only");
            let _ = interrupt.recv().await;
            info!("Received SIGINT signal");
        }
        (Err(term_err), Err(int_err)) => {
            error!(
                sigterm_error = %term_err,
                sigint_error = %int_err,
                "Failed to register both SIGTERM and SIGINT handlers"
            );
            warn!("Falling back to Ctrl+C handler");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
    }
}

#[cfg(not(unix))]
#[instrument]
async fn shutdown_signal() {
    info!("Waiting for Ctrl+C signal");
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C signal");
}
