//! Durable marker documents for crash-safe download/install recovery.
//!
//! Two small JSON documents live at fixed paths in the data directory: one
//! recording a download in progress, one recording a fully verified package
//! that is ready to install. They are the only state shared across runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::UpdateDescriptor;
use crate::version::Version;

/// The two marker kinds the store knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Download,
    Install,
}

impl MarkerKind {
    fn file_name(self) -> &'static str {
        match self {
            MarkerKind::Download => "update_download.json",
            MarkerKind::Install => "update_ready.json",
        }
    }
}

/// Record of a download in progress.
///
/// `current_version` is the version of the binary that *started* the
/// download; a marker whose current_version differs from the running binary
/// is stale and gets discarded instead of resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMarker {
    pub current_version: String,
    pub update_channel: String,
    pub update_version: String,
    pub url: String,
    pub hash: String,
    pub path: PathBuf,
    pub required: bool,
    #[serde(default)]
    pub more_info: String,
}

impl DownloadMarker {
    pub fn new(descriptor: &UpdateDescriptor, origin_version: Version, path: PathBuf) -> Self {
        Self {
            current_version: origin_version.to_string(),
            update_channel: descriptor.channel.clone(),
            update_version: descriptor.version.clone(),
            url: descriptor.url.clone(),
            hash: descriptor.hash.clone(),
            path,
            required: descriptor.required,
            more_info: descriptor.more_info.clone(),
        }
    }

    /// Rebuild the descriptor this marker was created from, for resume
    pub fn descriptor(&self) -> UpdateDescriptor {
        UpdateDescriptor {
            url: self.url.clone(),
            hash: self.hash.clone(),
            channel: self.update_channel.clone(),
            version: self.update_version.clone(),
            required: self.required,
            more_info: self.more_info.clone(),
        }
    }
}

/// Record of a downloaded, hash-verified package ready to install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMarker {
    pub current_version: String,
    pub update_channel: String,
    pub update_version: String,
    pub hash: String,
    pub path: PathBuf,
    pub required: bool,
    #[serde(default)]
    pub more_info: String,
}

impl InstallMarker {
    pub fn from_download(marker: &DownloadMarker) -> Self {
        Self {
            current_version: marker.current_version.clone(),
            update_channel: marker.update_channel.clone(),
            update_version: marker.update_version.clone(),
            hash: marker.hash.clone(),
            path: marker.path.clone(),
            required: marker.required,
            more_info: marker.more_info.clone(),
        }
    }
}

/// Atomic key/value persistence for the two marker documents.
///
/// Writes go to a temp file in the same directory followed by a rename, so a
/// reader never observes a half-written marker even across a process crash.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: MarkerKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn write_download(&self, marker: &DownloadMarker) -> Result<()> {
        self.write(MarkerKind::Download, marker)
    }

    pub fn write_install(&self, marker: &InstallMarker) -> Result<()> {
        self.write(MarkerKind::Install, marker)
    }

    pub fn read_download(&self) -> Option<DownloadMarker> {
        self.read(MarkerKind::Download)
    }

    pub fn read_install(&self) -> Option<InstallMarker> {
        self.read(MarkerKind::Install)
    }

    /// Delete the marker of the given kind; deleting a missing marker is a
    /// no-op
    pub fn delete(&self, kind: MarkerKind) -> Result<()> {
        let path = self.path(kind);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("[MarkerStore] Deleted {:?} marker: {:?}", kind, path);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to delete marker: {:?}", path))
            }
        }
    }

    fn write<T: Serialize>(&self, kind: MarkerKind, record: &T) -> Result<()> {
        let path = self.path(kind);
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(record)
            .with_context(|| format!("Failed to serialize {:?} marker", kind))?;
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write marker temp file: {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to move marker into place: {:?}", path))?;

        log::debug!("[MarkerStore] Wrote {:?} marker: {:?}", kind, path);
        Ok(())
    }

    /// Read the marker of the given kind; a missing file is absence, a
    /// malformed file is removed and treated as absent
    fn read<T: DeserializeOwned>(&self, kind: MarkerKind) -> Option<T> {
        let path = self.path(kind);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::error!("[MarkerStore] Failed to read marker {:?}: {}", path, err);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!(
                    "[MarkerStore] Malformed {:?} marker, removing: {}",
                    kind,
                    err
                );
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }
}

/// Remove a partial download left behind at `path`, if any
pub fn remove_partial_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::info!("[MarkerStore] Removed partial file: {:?}", path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("[MarkerStore] Failed to remove {:?}: {}", path, err),
    }
}
