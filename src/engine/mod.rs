//! Backing download engines behind one add/cancel/pause/query contract.
//!
//! Each adapter picks a notification mode:
//! - [`NotificationMode::Push`]: the adapter runs its own task and calls the
//!   job's [`TransferListener`] as engine events happen.
//! - [`NotificationMode::Polled`]: the adapter never calls back; the
//!   [`crate::poller::EnginePoller`] diffs `query_status` results instead.
//!
//! Every adapter answers `query_status`, so progress is always pull-based.

pub mod aria2;
pub mod jdownloader;
pub mod mega;
pub mod telegram;
pub mod yt_dlp;

use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{EngineHandle, EngineKind, Origin, Source, TransferMetrics, UploadTarget};
use async_trait::async_trait;
use moka::future::Cache;
use std::{path::Path, sync::Arc, time::Duration};

pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationMode {
    Push,
    Polled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Waiting,
    Active,
    Paused,
    Complete,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    pub name: Option<String>,
    pub metrics: TransferMetrics,
    pub state: EngineState,
    /// Set when the engine replaced this handle (torrent metadata resolved).
    pub followed_by: Option<EngineHandle>,
    pub error_message: Option<String>,
    pub is_torrent: bool,
}

impl EngineStatus {
    pub fn new(state: EngineState) -> Self {
        Self {
            name: None,
            metrics: TransferMetrics::default(),
            state,
            followed_by: None,
            error_message: None,
            is_torrent: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    pub custom_name: Option<String>,
}

#[async_trait]
pub trait DownloadEngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn notification_mode(&self) -> NotificationMode;

    async fn add_download(
        &self,
        source: &Source,
        dest_dir: &Path,
        options: &AddOptions,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError>;

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    async fn query_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError>;
}

#[async_trait]
pub trait UploadAdapter: Send + Sync {
    fn target(&self) -> UploadTarget;

    /// Uploaders that only take single files get directories tarred first.
    fn accepts_directories(&self) -> bool {
        true
    }

    /// Starts uploading in the background and returns at once. `origin` is
    /// where chat-based targets deliver the file.
    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
        origin: &Origin,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError>;

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    fn query_status(&self, handle: &EngineHandle) -> Option<EngineStatus>;
}

/// Short-lived per-handle cache in front of remote status calls.
#[derive(Clone)]
pub struct StatusCache {
    inner: Cache<EngineHandle, EngineStatus>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(STATUS_CACHE_TTL)
    }
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder().max_capacity(4096).time_to_live(ttl).build(),
        }
    }

    pub async fn get_or_fetch<F, Fut>(
        &self,
        handle: &EngineHandle,
        fetch: F,
    ) -> Result<EngineStatus, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<EngineStatus, EngineError>>,
    {
        if let Some(status) = self.inner.get(handle).await {
            return Ok(status);
        }
        let status = fetch().await?;
        self.inner.insert(handle.clone(), status.clone()).await;
        Ok(status)
    }

    pub async fn invalidate(&self, handle: &EngineHandle) {
        self.inner.invalidate(handle).await;
    }
}

/// ETA from remaining bytes and current speed; `None` while stalled.
pub fn estimate_eta(total: u64, done: u64, speed_bps: u64) -> Option<Duration> {
    if speed_bps == 0 || total == 0 {
        return None;
    }
    Some(Duration::from_secs(total.saturating_sub(done) / speed_bps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn eta_needs_speed_and_size() {
        assert_eq!(estimate_eta(100, 0, 0), None);
        assert_eq!(estimate_eta(0, 0, 10), None);
        assert_eq!(estimate_eta(100, 40, 10), Some(Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn cache_serves_repeated_queries() {
        let cache = StatusCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let handle = EngineHandle::from_raw("G1");
        for _ in 0..3 {
            let status = cache
                .get_or_fetch(&handle, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(EngineStatus::new(EngineState::Active))
                })
                .await
                .unwrap();
            assert_eq!(status.state, EngineState::Active);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate(&handle).await;
        cache
            .get_or_fetch(&handle, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(EngineStatus::new(EngineState::Paused))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
