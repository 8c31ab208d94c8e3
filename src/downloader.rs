use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::markers::{DownloadMarker, InstallMarker, MarkerKind, MarkerStore, remove_partial_file};
use crate::types::UpdateDescriptor;
use crate::version::Version;

/// Terminal result of a transfer attempt
#[derive(Debug)]
pub enum DownloadResult {
    /// Package downloaded and verified; the install marker is on disk and
    /// the download marker is gone
    Complete(InstallMarker),
    /// Transfer aborted by [`CancelHandle::cancel`]; marker and partial file
    /// are left in place so a later resume can pick up
    Cancelled,
    /// Transfer failed. `resumable` is true for transport failures (marker
    /// retained) and false for verification failures, hash missing or
    /// mismatched (file and marker discarded)
    Failed { message: String, resumable: bool },
}

/// Cooperative cancellation for an in-flight transfer.
///
/// The download loop observes the flag between chunks; cancelling does not
/// force-terminate I/O.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Rate limiter for the transfer loop: a token bucket refilled by elapsed
/// wall-clock time, capped at one second of burst
struct Throttle {
    bytes_per_sec: f64,
    available: f64,
    last_refill: tokio::time::Instant,
}

impl Throttle {
    fn new(kibps: u64) -> Option<Self> {
        if kibps == 0 {
            return None;
        }
        let bytes_per_sec = (kibps * 1024) as f64;
        Some(Self {
            bytes_per_sec,
            available: bytes_per_sec,
            last_refill: tokio::time::Instant::now(),
        })
    }

    async fn acquire(&mut self, bytes: usize) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available = (self.available + elapsed * self.bytes_per_sec).min(self.bytes_per_sec);

        self.available -= bytes as f64;
        if self.available < 0.0 {
            let wait = -self.available / self.bytes_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// Resumable, rate-limited package downloader.
///
/// Writes the download marker before the first byte is requested, appends to
/// any partial file already at the destination via an HTTP range request, and
/// promotes the download marker to an install marker once the content hash
/// checks out.
pub struct PackageDownloader {
    client: Client,
    markers: MarkerStore,
    download_dir: PathBuf,
    bandwidth_limit_kibps: u64,
    cancel: CancelHandle,
}

impl PackageDownloader {
    pub fn new(
        markers: MarkerStore,
        download_dir: impl Into<PathBuf>,
        bandwidth_limit_kibps: u64,
    ) -> Result<Self> {
        let download_dir = download_dir.into();
        std::fs::create_dir_all(&download_dir)
            .with_context(|| format!("Failed to create download dir: {:?}", download_dir))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("update-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            markers,
            download_dir,
            bandwidth_limit_kibps,
            cancel: CancelHandle::new(),
        })
    }

    /// Handle for cancelling whatever transfer is currently running
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Destination path for a descriptor, derived deterministically from
    /// channel and version so repeated attempts target the same file
    pub fn package_path(&self, descriptor: &UpdateDescriptor) -> PathBuf {
        self.download_dir.join(format!(
            "update-{}-{}.pkg",
            descriptor.channel.to_lowercase(),
            descriptor.version
        ))
    }

    /// Delete leftover package files from earlier update cycles.
    ///
    /// Package paths embed the channel and version, so every superseded
    /// download leaves its own `update-*.pkg` behind; this removes them all
    /// except `keep` (the package an active marker still points at).
    pub fn sweep_stale_packages(&self, keep: Option<&Path>) {
        let entries = match std::fs::read_dir(&self.download_dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "[PackageDownloader] Failed to read {:?}: {}",
                    self.download_dir,
                    err
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if Some(path.as_path()) == keep {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("update-") || !name.ends_with(".pkg") {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => log::info!("[PackageDownloader] Removed stale package {:?}", path),
                Err(err) => {
                    log::warn!("[PackageDownloader] Failed to remove {:?}: {}", path, err)
                }
            }
        }
    }

    /// Start a fresh download of `descriptor`.
    ///
    /// The download marker is written (recording `origin_version`, the
    /// running binary that initiated it) before any bytes are transferred.
    pub async fn download(
        &self,
        descriptor: &UpdateDescriptor,
        origin_version: Version,
    ) -> DownloadResult {
        let path = self.package_path(descriptor);
        self.sweep_stale_packages(Some(&path));
        let marker = DownloadMarker::new(descriptor, origin_version, path);

        if let Err(err) = self.markers.write_download(&marker) {
            return DownloadResult::Failed {
                message: format!("failed to persist download marker: {:#}", err),
                resumable: false,
            };
        }

        log::info!(
            "[PackageDownloader] Starting download of {} -> {:?}",
            marker.url,
            marker.path
        );
        self.transfer(&marker).await
    }

    /// Resume the download described by an existing marker; bytes already at
    /// the destination path are not re-requested
    pub async fn resume(&self, marker: &DownloadMarker) -> DownloadResult {
        log::info!(
            "[PackageDownloader] Resuming download of {} -> {:?}",
            marker.url,
            marker.path
        );
        self.transfer(marker).await
    }

    async fn transfer(&self, marker: &DownloadMarker) -> DownloadResult {
        self.cancel.reset();

        match self.run_transfer(marker).await {
            Ok(TransferEnd::Complete) => self.verify_and_promote(marker).await,
            Ok(TransferEnd::Cancelled) => {
                log::info!("[PackageDownloader] Transfer cancelled, marker retained");
                DownloadResult::Cancelled
            }
            // Transport failure: keep marker and partial file for a later resume
            Err(err) => {
                log::error!("[PackageDownloader] Transfer failed: {:#}", err);
                DownloadResult::Failed {
                    message: format!("{:#}", err),
                    resumable: true,
                }
            }
        }
    }

    async fn run_transfer(&self, marker: &DownloadMarker) -> Result<TransferEnd> {
        let existing_len = match tokio::fs::metadata(&marker.path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(&marker.url);
        if existing_len > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", existing_len));
            log::info!(
                "[PackageDownloader] Requesting range from byte {}",
                existing_len
            );
        }

        let response = request.send().await.context("request failed")?;
        let status = response.status();

        // The server already has nothing left to give us
        if existing_len > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            log::info!("[PackageDownloader] Range not satisfiable, treating file as complete");
            return Ok(TransferEnd::Complete);
        }

        if !status.is_success() {
            return Err(anyhow!("package server returned {}", status));
        }

        // A 200 answer to a ranged request means the server ignored the
        // range; start over rather than appending a second copy
        let append = existing_len > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&marker.path)
            .await
            .with_context(|| format!("failed to open {:?}", marker.path))?;
        if !append && existing_len > 0 {
            log::warn!("[PackageDownloader] Server ignored range request, restarting from zero");
        }

        let mut throttle = Throttle::new(self.bandwidth_limit_kibps);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                file.flush().await.ok();
                return Ok(TransferEnd::Cancelled);
            }

            let chunk = chunk.context("transfer interrupted")?;
            if let Some(throttle) = throttle.as_mut() {
                throttle.acquire(chunk.len()).await;
            }
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {:?}", marker.path))?;
        }

        file.flush().await.context("failed to flush package file")?;
        Ok(TransferEnd::Complete)
    }

    /// Recompute the content hash of the completed file and promote the
    /// download marker to an install marker.
    ///
    /// The install marker is written before the download marker is deleted
    /// so a crash between the two leaves a recoverable (if briefly
    /// overlapping) state rather than a lost download.
    async fn verify_and_promote(&self, marker: &DownloadMarker) -> DownloadResult {
        // A marker with no expected hash cannot be verified; never hand an
        // unverifiable package to the installer
        if marker.hash.is_empty() {
            log::error!("[PackageDownloader] Download marker carries no expected hash");
            remove_partial_file(&marker.path);
            if let Err(err) = self.markers.delete(MarkerKind::Download) {
                log::warn!("[PackageDownloader] Failed to delete marker: {:#}", err);
            }
            return DownloadResult::Failed {
                message: "missing expected content hash, package discarded".to_string(),
                resumable: false,
            };
        }

        match hash_file(&marker.path).await {
            Ok(actual) => {
                if !actual.eq_ignore_ascii_case(&marker.hash) {
                    log::error!(
                        "[PackageDownloader] Hash mismatch: expected {}, got {}",
                        marker.hash,
                        actual
                    );
                    remove_partial_file(&marker.path);
                    if let Err(err) = self.markers.delete(MarkerKind::Download) {
                        log::warn!("[PackageDownloader] Failed to delete marker: {:#}", err);
                    }
                    return DownloadResult::Failed {
                        message: format!(
                            "hash mismatch: expected {}, got {}",
                            marker.hash, actual
                        ),
                        resumable: false,
                    };
                }
            }
            Err(err) => {
                return DownloadResult::Failed {
                    message: format!("failed to hash package: {:#}", err),
                    resumable: true,
                };
            }
        }

        let install_marker = InstallMarker::from_download(marker);
        if let Err(err) = self.markers.write_install(&install_marker) {
            return DownloadResult::Failed {
                message: format!("failed to persist install marker: {:#}", err),
                resumable: true,
            };
        }
        if let Err(err) = self.markers.delete(MarkerKind::Download) {
            log::warn!("[PackageDownloader] Failed to delete download marker: {:#}", err);
        }

        log::info!(
            "[PackageDownloader] Download complete and verified: {:?}",
            install_marker.path
        );
        DownloadResult::Complete(install_marker)
    }
}

enum TransferEnd {
    Complete,
    Cancelled,
}

/// Stream a file through sha-256 and return the lowercase hex digest
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
