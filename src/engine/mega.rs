use super::jdownloader::{map_package_status, JdClient, PackageRequest, Priority};
use super::{AddOptions, DownloadEngineAdapter, EngineStatus, NotificationMode, StatusCache};
use crate::config::Credentials;
use crate::error::EngineError;
use crate::listener::TransferListener;
use crate::tasks::{EngineHandle, EngineKind, Source};
use async_trait::async_trait;
use regex::Regex;
use std::{
    path::Path,
    sync::{Arc, LazyLock},
};
use tracing::{debug, info, instrument};

pub static MEGA_LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^https?://(?:www\.)?mega(?:\.co)?\.nz/(file|folder)/",
        r"[a-zA-Z0-9_-]+(?:#[a-zA-Z0-9_-]+)?",
    ))
    .unwrap()
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MegaLinkKind {
    File,
    Folder,
}

impl MegaLinkKind {
    fn label(self) -> &'static str {
        match self {
            MegaLinkKind::File => "file",
            MegaLinkKind::Folder => "folder",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MegaLink {
    pub kind: MegaLinkKind,
    pub id: String,
    pub key: Option<String>,
}

pub fn is_mega_link(link: &str) -> bool {
    MEGA_LINK_REGEX.is_match(link)
}

pub fn parse_mega_link(link: &str) -> Option<MegaLink> {
    if !is_mega_link(link) {
        return None;
    }
    let url = url::Url::parse(link).ok()?;
    let mut segments = url.path_segments()?;
    let kind = match segments.next()? {
        "file" => MegaLinkKind::File,
        "folder" => MegaLinkKind::Folder,
        _ => return None,
    };
    let id = segments.next().filter(|id| !id.is_empty())?.to_string();
    Some(MegaLink {
        kind,
        id,
        key: url.fragment().filter(|f| !f.is_empty()).map(str::to_string),
    })
}

pub struct MegaAdapter {
    client: Arc<JdClient>,
    credentials: Option<Credentials>,
    cache: StatusCache,
}

impl MegaAdapter {
    pub fn new(client: Arc<JdClient>, credentials: Option<Credentials>) -> Self {
        Self {
            client,
            credentials,
            cache: StatusCache::default(),
        }
    }

    fn package_for(&self, link: &str, mega: &MegaLink, dest_dir: &Path) -> PackageRequest {
        let comment = format!("MEGA {} download", mega.kind.label());
        let mut package = PackageRequest::for_dest(link, dest_dir, comment);
        if package.package_name.is_empty() {
            package.package_name = format!("mega_{}_{}", mega.kind.label(), mega.id);
        }
        package.priority = Priority::High;
        package.extract_after_download = false;
        package.download_password = self
            .credentials
            .as_ref()
            .map(|c| format!("{}:{}", c.username, c.password));
        package
    }
}

#[async_trait]
impl DownloadEngineAdapter for MegaAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Mega
    }

    fn notification_mode(&self) -> NotificationMode {
        NotificationMode::Polled
    }

    #[instrument(skip(self, _options, _listener), fields(dir = %dest_dir.display()))]
    async fn add_download(
        &self,
        source: &Source,
        dest_dir: &Path,
        _options: &AddOptions,
        _listener: Arc<dyn TransferListener>,
    ) -> Result<EngineHandle, EngineError> {
        let Source::Uri(link) = source else {
            return Err(EngineError::InvalidSource(source.describe().to_string()));
        };
        let mega = parse_mega_link(link)
            .ok_or_else(|| EngineError::InvalidSource("Invalid MEGA link provided".into()))?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let handle = self
            .client
            .add_package(&self.package_for(link, &mega, dest_dir))
            .await?;
        info!(event = "mega_package_added", package = %handle, kind = mega.kind.label());
        Ok(handle)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.client.stop_package(handle).await?;
        self.cache.invalidate(handle).await;
        debug!(event = "mega_package_stopped", package = %handle);
        Ok(())
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.cancel(handle).await
    }

    async fn query_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        self.cache
            .get_or_fetch(handle, || async {
                let status = self.client.package_status(handle).await?;
                Ok(map_package_status(status, "MEGA download failed"))
            })
            .await
    }
}
