use super::{ActiveUploads, UploadProgress, UPLOAD_CANCELLED};
use crate::config::DriveConfig;
use crate::engine::{EngineStatus, UploadAdapter};
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{EngineHandle, Origin, UploadTarget};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Body, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, Instrument};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const BINARY_MIME: &str = "application/octet-stream";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    name: &'a str,
    parents: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

pub fn file_link(id: &str) -> String {
    format!("https://drive.google.com/uc?id={id}&export=download")
}

pub fn folder_link(id: &str) -> String {
    format!("https://drive.google.com/drive/folders/{id}")
}

#[derive(Clone)]
struct DriveClient {
    http: reqwest::Client,
    token: String,
    team_drive: bool,
}

impl DriveClient {
    fn query(&self) -> Vec<(&'static str, &'static str)> {
        let mut query = vec![("fields", "id")];
        if self.team_drive {
            query.push(("supportsAllDrives", "true"));
        }
        query
    }

    async fn create_folder(&self, name: &str, parent: &str) -> Result<String, EngineError> {
        let response = self
            .http
            .post(FILES_URL)
            .bearer_auth(&self.token)
            .query(&self.query())
            .json(&FileMetadata {
                name,
                parents: [parent],
                mime_type: Some(FOLDER_MIME),
            })
            .send()
            .await?;
        let created: CreatedFile = check(response, "folder creation").await?.json().await?;
        debug!(event = "drive_folder_created", name, id = %created.id);
        Ok(created.id)
    }

    async fn upload_file(
        &self,
        path: &Path,
        name: &str,
        parent: &str,
        progress: &Arc<UploadProgress>,
    ) -> Result<String, EngineError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let mut query = self.query();
        query.push(("uploadType", "resumable"));
        let response = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(&self.token)
            .query(&query)
            .header("X-Upload-Content-Type", BINARY_MIME)
            .header("X-Upload-Content-Length", size)
            .json(&FileMetadata {
                name,
                parents: [parent],
                mime_type: None,
            })
            .send()
            .await?;
        let response = check(response, "upload session").await?;
        let session = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| EngineError::Malformed("upload session without location".into()))?
            .to_string();

        let counter = progress.clone();
        let body = ReaderStream::new(file).map(move |chunk: std::io::Result<Bytes>| {
            if let Ok(bytes) = &chunk {
                counter.add(bytes.len() as u64);
            }
            chunk
        });
        let response = self
            .http
            .put(session)
            .header(header::CONTENT_LENGTH, size)
            .body(Body::wrap_stream(body))
            .send()
            .await?;
        let created: CreatedFile = check(response, "upload").await?.json().await?;
        debug!(event = "drive_file_uploaded", name, id = %created.id, size);
        Ok(created.id)
    }

    /// Mirrors a local tree under `parent` and returns the id of the new top
    /// folder.
    async fn upload_dir(
        &self,
        root: &Path,
        name: &str,
        parent: &str,
        progress: &Arc<UploadProgress>,
        listener: &dyn TransferListener,
    ) -> Result<String, EngineError> {
        let top = self.create_folder(name, parent).await?;
        let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), top.clone())];
        while let Some((dir, folder)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await?.is_dir() {
                    let child = self.create_folder(&entry_name, &folder).await?;
                    pending.push((entry.path(), child));
                } else {
                    self.upload_file(&entry.path(), &entry_name, &folder, progress)
                        .await?;
                    listener.on_upload_progress();
                }
            }
        }
        Ok(top)
    }
}

async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Rpc {
        code: i64::from(status.as_u16()),
        message: match status {
            StatusCode::UNAUTHORIZED => format!("{what} rejected: access token expired or invalid"),
            _ => format!("{what} failed: {body}"),
        },
    })
}

pub struct DriveUploader {
    client: DriveClient,
    folder_id: String,
    uploads: ActiveUploads,
}

impl DriveUploader {
    pub fn new(config: &DriveConfig, http: reqwest::Client) -> Self {
        Self {
            client: DriveClient {
                http,
                token: config.access_token.clone(),
                team_drive: config.team_drive,
            },
            folder_id: config.folder_id.clone(),
            uploads: ActiveUploads::default(),
        }
    }
}

#[async_trait]
impl UploadAdapter for DriveUploader {
    fn target(&self) -> UploadTarget {
        UploadTarget::Drive
    }

    #[instrument(skip(self, _origin, listener), fields(path = %path.display()))]
    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
        _origin: &Origin,
        listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        let metadata = tokio::fs::metadata(path).await?;
        let total = if metadata.is_dir() {
            crate::archive::disk_usage(path).await
        } else {
            metadata.len()
        };
        let (handle, progress, cancel) = self.uploads.begin(display_name, total);
        info!(event = "drive_upload_started", handle = %handle, total);

        let client = self.client.clone();
        let parent = self.folder_id.clone();
        let uploads = self.uploads.clone();
        let path = path.to_path_buf();
        let name = display_name.to_string();
        let task_handle = handle.clone();
        tokio::spawn(
            async move {
                listener.on_upload_started();
                let work = async {
                    if metadata.is_dir() {
                        client
                            .upload_dir(&path, &name, &parent, &progress, listener.as_ref())
                            .await
                            .map(|id| folder_link(&id))
                    } else {
                        client
                            .upload_file(&path, &name, &parent, &progress)
                            .await
                            .map(|id| file_link(&id))
                    }
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(None),
                    result = work => result.map_err(Some),
                };
                uploads.end(&task_handle);
                match result {
                    Ok(link) => {
                        progress.finish();
                        info!(event = "drive_upload_complete", handle = %task_handle, link = %link);
                        listener.on_upload_complete(&link);
                    }
                    Err(None) => {
                        info!(event = "drive_upload_cancelled", handle = %task_handle);
                        listener.on_upload_error(UPLOAD_CANCELLED);
                    }
                    Err(Some(err)) => {
                        error!(event = "drive_upload_failed", handle = %task_handle, error = %err);
                        listener.on_upload_error(&err.to_string());
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
