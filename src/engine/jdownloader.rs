use super::{
    estimate_eta, AddOptions, DownloadEngineAdapter, EngineState, EngineStatus, NotificationMode,
    StatusCache,
};
use crate::config::{Credentials, JDownloaderConfig};
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{EngineHandle, EngineKind, Source, TransferMetrics};
use async_trait::async_trait;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

const JD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Device {
    id: Value,
}

#[derive(Debug, Deserialize)]
struct CreatedPackage {
    id: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub bytes_loaded: u64,
    #[serde(default)]
    pub bytes_total: u64,
    #[serde(default)]
    pub speed: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Default,
    High,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequest {
    pub links: Vec<String>,
    pub package_name: String,
    pub download_folder: String,
    pub extract_password: Option<String>,
    pub priority: Priority,
    pub enabled: bool,
    pub extract_after_download: bool,
    pub download_password: Option<String>,
    pub note: String,
}

impl PackageRequest {
    /// Package that lands in `dest_dir`: JDownloader creates a folder named
    /// after the package inside the download folder.
    pub fn for_dest(link: &str, dest_dir: &Path, note: impl Into<String>) -> Self {
        let package_name = dest_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let download_folder = dest_dir
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            links: vec![link.to_string()],
            package_name,
            download_folder,
            extract_password: None,
            priority: Priority::Default,
            enabled: true,
            extract_after_download: false,
            download_password: None,
            note: note.into(),
        }
    }
}

pub struct JdClient {
    http: reqwest::Client,
    host: String,
    credentials: Option<Credentials>,
    configured_device: Option<String>,
    device: OnceCell<String>,
}

impl JdClient {
    pub fn new(config: &JDownloaderConfig, http: reqwest::Client) -> Self {
        if config.credentials.is_none() {
            warn!(event = "jdownloader_no_credentials", "using unauthenticated JDownloader API");
        }
        Self {
            http,
            host: config.host.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
            configured_device: config.device_id.clone(),
            device: OnceCell::new(),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&PackageRequest>,
    ) -> Result<Envelope<T>, EngineError> {
        let mut request = self
            .http
            .request(method, format!("{}{endpoint}", self.host))
            .timeout(JD_REQUEST_TIMEOUT);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                EngineError::Timeout(JD_REQUEST_TIMEOUT)
            } else {
                err.into()
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Rpc {
                code: i64::from(status.as_u16()),
                message: format!("{endpoint} returned {status}"),
            });
        }
        Ok(response.json().await?)
    }

    /// Configured device, else the first one JDownloader reports.
    pub async fn device_id(&self) -> Result<&str, EngineError> {
        if let Some(device) = &self.configured_device {
            return Ok(device.as_str());
        }
        self.device
            .get_or_try_init(|| async {
                let downloads: Envelope<Value> =
                    self.request(Method::GET, "/api/v2/downloads", None).await?;
                if let (Some(_), Some(device)) = (downloads.data, downloads.device_id) {
                    return Ok::<String, EngineError>(device);
                }
                let devices: Envelope<Vec<Device>> =
                    self.request(Method::GET, "/api/v2/devices", None).await?;
                devices
                    .data
                    .and_then(|list| list.into_iter().next())
                    .and_then(|device| id_string(&device.id))
                    .ok_or_else(|| {
                        EngineError::Unreachable("No JDownloader device available".into())
                    })
            })
            .await
            .map(String::as_str)
    }

    pub async fn add_package(&self, package: &PackageRequest) -> Result<EngineHandle, EngineError> {
        let device = self.device_id().await?;
        let created: Envelope<CreatedPackage> = self
            .request(
                Method::POST,
                &format!("/api/v2/downloads/{device}/packages"),
                Some(package),
            )
            .await?;
        created
            .data
            .and_then(|package| id_string(&package.id))
            .map(EngineHandle::from_raw)
            .ok_or_else(|| EngineError::Malformed("package creation returned no id".into()))
    }

    pub async fn package_status(
        &self,
        package_id: &EngineHandle,
    ) -> Result<PackageStatus, EngineError> {
        let device = self.device_id().await?;
        let status: Envelope<PackageStatus> = self
            .request(
                Method::GET,
                &format!("/api/v2/downloads/{device}/packages/{package_id}"),
                None,
            )
            .await?;
        status
            .data
            .ok_or_else(|| EngineError::UnknownHandle(package_id.to_string()))
    }

    pub async fn stop_package(&self, package_id: &EngineHandle) -> Result<(), EngineError> {
        let device = self.device_id().await?;
        let _: Envelope<Value> = self
            .request(
                Method::POST,
                &format!("/api/v2/downloads/{device}/packages/{package_id}/stop"),
                None,
            )
            .await?;
        Ok(())
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub struct JDownloaderAdapter {
    client: Arc<JdClient>,
    cache: StatusCache,
}

impl JDownloaderAdapter {
    pub fn new(client: Arc<JdClient>) -> Self {
        Self {
            client,
            cache: StatusCache::default(),
        }
    }
}

#[async_trait]
impl DownloadEngineAdapter for JDownloaderAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::JDownloader
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
        let Source::Uri(link) = source else {
            return Err(EngineError::InvalidSource(source.describe().to_string()));
        };
        let mut package = PackageRequest::for_dest(link, dest_dir, "mirror download");
        if package.package_name.is_empty() {
            package.package_name = "download".to_string();
        }
        if let Some(name) = &options.custom_name {
            package.note = format!("mirror download as {name}");
        }
        let handle = self.client.add_package(&package).await?;
        info!(event = "jdownloader_package_added", package = %handle);
        Ok(handle)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.client.stop_package(handle).await?;
        self.cache.invalidate(handle).await;
        debug!(event = "jdownloader_package_stopped", package = %handle);
        Ok(())
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.cancel(handle).await
    }

    async fn query_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        self.cache
            .get_or_fetch(handle, || async {
                let status = self.client.package_status(handle).await?;
                Ok(map_package_status(status, "download failed"))
            })
            .await
    }
}

pub(crate) fn map_package_status(status: PackageStatus, default_error: &str) -> EngineStatus {
    let state = match status.status.to_uppercase().as_str() {
        "FINISHED" | "COMPLETED" => EngineState::Complete,
        "FAILED" | "ERROR" => EngineState::Failed,
        "CANCELLED" | "STOPPED" => EngineState::Paused,
        "RUNNING" | "DOWNLOADING" => EngineState::Active,
        _ => EngineState::Waiting,
    };
    let error_message = (state == EngineState::Failed).then(|| {
        status
            .error_message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_error.to_string())
    });
    EngineStatus {
        name: status.name.filter(|n| !n.is_empty()),
        metrics: TransferMetrics {
            total_bytes: status.bytes_total,
            processed_bytes: status.bytes_loaded,
            speed_bps: status.speed,
            eta: estimate_eta(status.bytes_total, status.bytes_loaded, status.speed),
        },
        state,
        followed_by: None,
        error_message,
        is_torrent: false,
    }
}
