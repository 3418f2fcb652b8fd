pub mod drive;
pub mod telegram;

use crate::engine::{estimate_eta, EngineState, EngineStatus};
use crate::error::EngineError;
use crate::tasks::{EngineHandle, TransferMetrics};
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;

pub const UPLOAD_CANCELLED: &str = "Cancelled by user!";

#[derive(Debug)]
pub struct UploadProgress {
    name: String,
    total: u64,
    sent: AtomicU64,
    started: Instant,
}

impl UploadProgress {
    pub fn add(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn restart(&self) {
        self.sent.store(0, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.sent.store(self.total, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> TransferMetrics {
        let mut sent = self.sent.load(Ordering::Relaxed);
        if self.total > 0 {
            sent = sent.min(self.total);
        }
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-3);
        let speed = (sent as f64 / elapsed) as u64;
        TransferMetrics {
            total_bytes: self.total,
            processed_bytes: sent,
            speed_bps: speed,
            eta: estimate_eta(self.total, sent, speed),
        }
    }
}

struct ActiveUpload {
    progress: Arc<UploadProgress>,
    cancel: CancellationToken,
}

/// Uploads in flight for one uploader, keyed by the handle it minted.
#[derive(Clone, Default)]
pub struct ActiveUploads {
    inner: Arc<DashMap<EngineHandle, ActiveUpload>>,
}

impl ActiveUploads {
    pub fn begin(
        &self,
        name: &str,
        total: u64,
    ) -> (EngineHandle, Arc<UploadProgress>, CancellationToken) {
        let handle = EngineHandle::generate();
        let progress = Arc::new(UploadProgress {
            name: name.to_string(),
            total,
            sent: AtomicU64::new(0),
            started: Instant::now(),
        });
        let cancel = CancellationToken::new();
        self.inner.insert(
            handle.clone(),
            ActiveUpload {
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );
        (handle, progress, cancel)
    }

    pub fn end(&self, handle: &EngineHandle) {
        self.inner.remove(handle);
    }

    pub fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let upload = self
            .inner
            .get(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        upload.cancel.cancel();
        Ok(())
    }

    pub fn status(&self, handle: &EngineHandle) -> Option<EngineStatus> {
        let upload = self.inner.get(handle)?;
        Some(EngineStatus {
            name: Some(upload.progress.name.clone()),
            metrics: upload.progress.metrics(),
            ..EngineStatus::new(EngineState::Active)
        })
    }
}
