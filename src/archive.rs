use crate::error::ArchiveError;
use flate2::read::GzDecoder;
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tar::{Archive as TarArchive, Builder as TarBuilder};
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Longest first, so `.tar.gz` wins over `.gz`.
const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.bz2", ".tar.gz", ".tar.xz", ".tar", ".tbz2", ".tgz", ".zip", ".7z", ".bz2", ".gz",
    ".rar", ".iso", ".wim", ".cab", ".apm", ".arj", ".chm", ".cpio", ".cramfs", ".deb", ".dmg",
    ".fat", ".hfs", ".lzh", ".lzma", ".mbr", ".msi", ".mslz", ".nsis", ".ntfs", ".rpm",
    ".squashfs", ".udf", ".vhd", ".xar", ".z",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NativeFormat {
    Zip,
    Tar,
    TarGz,
}

#[derive(Clone, Debug)]
pub struct LocalArchiver {
    extract_command: String,
}

impl LocalArchiver {
    pub fn new(extract_command: impl Into<String>) -> Self {
        Self {
            extract_command: extract_command.into(),
        }
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn tar(&self, path: &Path) -> Result<PathBuf, ArchiveError> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(ArchiveError::NotFound(path.display().to_string()));
        }
        let mut target = path.as_os_str().to_owned();
        target.push(".tar");
        let target = PathBuf::from(target);
        let source = path.to_path_buf();
        let output = target.clone();
        tokio::task::spawn_blocking(move || write_tar(&source, &output))
            .await
            .map_err(|e| ArchiveError::Command(e.to_string()))??;
        info!(event = "archive_created", target = %target.display());
        Ok(target)
    }

    /// Unpacks `path` next to itself, removes the archive and returns the
    /// extracted location. Fails with [`ArchiveError::NotSupported`] when `path` is no archive.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn extract(&self, path: &Path) -> Result<PathBuf, ArchiveError> {
        let target = base_name(path)?;
        match native_format(path) {
            Some(format) => {
                let source = path.to_path_buf();
                let output = target.clone();
                tokio::task::spawn_blocking(move || unpack(format, &source, &output))
                    .await
                    .map_err(|e| ArchiveError::Command(e.to_string()))??;
            }
            None => self.run_external(path).await?,
        }
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(event = "archive_cleanup_failed", error = %err);
        }
        info!(event = "archive_extracted", target = %target.display());
        Ok(target)
    }

    pub async fn path_size(&self, path: &Path) -> u64 {
        disk_usage(path).await
    }

    async fn run_external(&self, path: &Path) -> Result<(), ArchiveError> {
        debug!(event = "external_extract", command = %self.extract_command);
        let output = Command::new(&self.extract_command)
            .arg(path)
            .output()
            .await
            .map_err(|e| ArchiveError::Command(format!("{}: {e}", self.extract_command)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ArchiveError::Command(format!(
                "{} exited with {}: {}",
                self.extract_command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

pub async fn disk_usage(path: &Path) -> u64 {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size(&path))
        .await
        .unwrap_or(0)
}

/// Strips a known archive extension, case-insensitively.
pub fn base_name(path: &Path) -> Result<PathBuf, ArchiveError> {
    let text = path.to_string_lossy();
    let lower = text.to_lowercase();
    ARCHIVE_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| PathBuf::from(&text[..text.len() - ext.len()]))
        .ok_or_else(|| ArchiveError::NotSupported(path.display().to_string()))
}

fn native_format(path: &Path) -> Option<NativeFormat> {
    let lower = path.to_string_lossy().to_lowercase();
    if lower.ends_with(".zip") {
        Some(NativeFormat::Zip)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(NativeFormat::TarGz)
    } else if lower.ends_with(".tar") {
        Some(NativeFormat::Tar)
    } else {
        None
    }
}

fn write_tar(source: &Path, output: &Path) -> Result<(), ArchiveError> {
    let name = source
        .file_name()
        .ok_or_else(|| ArchiveError::NotFound(source.display().to_string()))?;
    let file = File::create(output)?;
    let mut builder = TarBuilder::new(file);
    if source.is_dir() {
        builder.append_dir_all(name, source)?;
    } else {
        builder.append_path_with_name(source, name)?;
    }
    builder.into_inner()?;
    Ok(())
}

fn unpack(format: NativeFormat, source: &Path, output: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(output)?;
    let file = File::open(source)?;
    match format {
        NativeFormat::Zip => zip::ZipArchive::new(file)?.extract(output)?,
        NativeFormat::Tar => TarArchive::new(file).unpack(output)?,
        NativeFormat::TarGz => TarArchive::new(GzDecoder::new(file)).unpack(output)?,
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !metadata.is_dir() {
        return metadata.len();
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| dir_size(&entry.path()))
                .sum()
        })
        .unwrap_or(0)
}
