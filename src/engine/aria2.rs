use super::{
    estimate_eta, AddOptions, DownloadEngineAdapter, EngineState, EngineStatus, NotificationMode,
    StatusCache,
};
use crate::config::Aria2Config;
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{safe_file_name, EngineHandle, EngineKind, Source, TransferMetrics};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info, instrument};

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Aria2Status {
    pub gid: String,
    pub status: String,
    #[serde(default)]
    pub total_length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub download_speed: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub files: Vec<Aria2File>,
    #[serde(default)]
    pub bittorrent: Option<Aria2Torrent>,
    #[serde(default)]
    pub info_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Aria2File {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Aria2Torrent {
    pub info: Option<Aria2TorrentInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Aria2TorrentInfo {
    pub name: String,
}

const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorMessage",
    "followedBy",
    "dir",
    "files",
    "bittorrent",
    "infoHash",
];

pub struct Aria2Adapter {
    client: reqwest::Client,
    rpc_url: String,
    secret: Option<String>,
    next_id: AtomicU64,
    cache: StatusCache,
}

impl Aria2Adapter {
    pub fn new(config: &Aria2Config, client: reqwest::Client) -> Self {
        Self {
            client,
            rpc_url: config.rpc_url.clone(),
            secret: config.secret.clone(),
            next_id: AtomicU64::new(1),
            cache: StatusCache::default(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, EngineError> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all_params.push(Value::String(format!("token:{secret}")));
        }
        all_params.extend(params);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            method,
            params: all_params,
        };
        let response: RpcResponse<T> = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(EngineError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| EngineError::Malformed(format!("{method}: empty result")))
    }

    async fn tell_status(&self, gid: &str) -> Result<Aria2Status, EngineError> {
        self.call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await
            .map_err(|err| match err {
                EngineError::Rpc { code: 1, .. } => EngineError::UnknownHandle(gid.to_string()),
                other => other,
            })
    }

    async fn force_pause(&self, gid: &str) -> Result<(), EngineError> {
        let _: String = self.call("aria2.forcePause", vec![json!(gid)]).await?;
        Ok(())
    }
}

#[async_trait]
impl DownloadEngineAdapter for Aria2Adapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Aria2
    }

    fn notification_mode(&self) -> NotificationMode {
        NotificationMode::Polled
    }

    #[instrument(skip(self, options, _listener), fields(dir = %dest_dir.display()))]
    async fn add_download(
        &self,
        source: &Source,
        dest_dir: &Path,
        options: &AddOptions,
        _listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        let uri = match source {
            Source::Uri(uri) | Source::Magnet(uri) => uri,
            other => return Err(EngineError::InvalidSource(other.describe().to_string())),
        };
        let mut aria_options = json!({ "dir": dest_dir.to_string_lossy() });
        let custom_name = options.custom_name.as_deref().and_then(safe_file_name);
        if let (Source::Uri(_), Some(name)) = (source, custom_name) {
            aria_options["out"] = json!(name);
        }
        let gid: String = self
            .call("aria2.addUri", vec![json!([uri]), aria_options])
            .await?;
        info!(event = "aria2_added", gid = %gid);
        Ok(EngineHandle::from_raw(gid))
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let status = self.tell_status(handle.as_str()).await?;
        if status.status == "waiting" {
            let _: String = self.call("aria2.remove", vec![json!(handle.as_str())]).await?;
            debug!(event = "aria2_removed_waiting", gid = %handle);
        } else {
            for follower in &status.followed_by {
                self.force_pause(follower).await?;
            }
            self.force_pause(handle.as_str()).await?;
        }
        self.cache.invalidate(handle).await;
        Ok(())
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.force_pause(handle.as_str()).await?;
        self.cache.invalidate(handle).await;
        Ok(())
    }

    async fn query_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        self.cache
            .get_or_fetch(handle, || async {
                let status = self.tell_status(handle.as_str()).await?;
                Ok(map_status(status))
            })
            .await
    }
}

pub(crate) fn map_status(status: Aria2Status) -> EngineStatus {
    let state = match status.status.as_str() {
        "active" => EngineState::Active,
        "waiting" => EngineState::Waiting,
        "complete" => EngineState::Complete,
        "error" => EngineState::Failed,
        // paused and removed
        _ => EngineState::Paused,
    };
    let total = status.total_length.parse().unwrap_or(0);
    let done = status.completed_length.parse().unwrap_or(0);
    let speed = status.download_speed.parse().unwrap_or(0);
    let is_torrent = status.bittorrent.is_some();
    EngineStatus {
        name: display_name(&status),
        metrics: TransferMetrics {
            total_bytes: total,
            processed_bytes: done,
            speed_bps: speed,
            eta: estimate_eta(total, done, speed),
        },
        state,
        followed_by: status
            .followed_by
            .first()
            .map(|gid| EngineHandle::from_raw(gid.clone())),
        error_message: status.error_message.filter(|m| !m.is_empty()),
        is_torrent,
    }
}

fn display_name(status: &Aria2Status) -> Option<String> {
    if let Some(torrent) = &status.bittorrent {
        return match &torrent.info {
            Some(info) => Some(info.name.clone()),
            None => status
                .info_hash
                .as_ref()
                .map(|hash| format!("[METADATA]{hash}")),
        };
    }
    let from_files = status
        .files
        .first()
        .filter(|file| !file.path.is_empty())
        .and_then(|file| {
            let relative = Path::new(&file.path)
                .strip_prefix(&status.dir)
                .unwrap_or_else(|_| Path::new(&file.path));
            relative
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
        });
    from_files.or_else(|| Some(status.gid.clone()))
}
