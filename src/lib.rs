//! Background update service.
//!
//! Periodically asks a remote manifest service whether a newer application
//! build exists, downloads the installer package with crash-safe
//! resumability, persists marker files so a restart mid-download can pick up
//! where it left off, and hands off to a platform installer process.
//!
//! The host application owns an [`UpdateCoordinator`], subscribes to its
//! [`UpdateEventBus`] to render progress and prompts, and calls
//! [`UpdateCoordinator::stop_checking`] on shutdown.

pub mod checker;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod event_bus;
pub mod installer;
pub mod markers;
pub mod types;
pub mod version;

pub use checker::{CheckOutcome, VersionChecker};
pub use config::UpdaterConfig;
pub use coordinator::UpdateCoordinator;
pub use downloader::{CancelHandle, DownloadResult, PackageDownloader};
pub use event_bus::{UpdateEvent, UpdateEventBus};
pub use installer::InstallInvoker;
pub use markers::{DownloadMarker, InstallMarker, MarkerKind, MarkerStore};
pub use types::{UpdateDescriptor, UpdateQuery, UpdaterState};
pub use version::Version;
