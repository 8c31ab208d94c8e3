use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::UpdateQuery;
use crate::version::Version;

/// Updater configuration, owned by the host application.
///
/// Every field has a serde default so a host can deserialize a partial
/// document and only override what it cares about.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdaterConfig {
    /// Manifest endpoint queried for new builds
    pub check_url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub platform_version: String,
    /// Opt in to test builds offered by the manifest service
    #[serde(default)]
    pub willing_to_test: bool,
    /// Fixed period between checks (and between retries; no backoff)
    #[serde(default = "default_check_period_secs")]
    pub check_period_secs: u64,
    /// Download bandwidth ceiling in KiB/s; 0 disables throttling
    #[serde(default)]
    pub bandwidth_limit_kibps: u64,
    /// Command launched with the downloaded package; receives the package
    /// path and a required/optional flag
    #[serde(default)]
    pub install_command: String,
    #[serde(default)]
    pub install_args: Vec<String>,
    /// Invoke the installer as soon as a verified package is available,
    /// rather than leaving the install marker for the next startup
    #[serde(default = "default_true")]
    pub auto_install: bool,
    /// Where marker files and the install id live; defaults to the
    /// platform user data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Where packages are downloaded to; defaults to `<data_dir>/downloads`
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

fn default_channel() -> String {
    "Release".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

pub const DEFAULT_CHECK_PERIOD_SECS: u64 = 3600;

fn default_check_period_secs() -> u64 {
    DEFAULT_CHECK_PERIOD_SECS
}

fn default_true() -> bool {
    true
}

impl UpdaterConfig {
    pub fn new(check_url: impl Into<String>) -> Self {
        Self {
            check_url: check_url.into(),
            channel: default_channel(),
            platform: default_platform(),
            platform_version: String::new(),
            willing_to_test: false,
            check_period_secs: DEFAULT_CHECK_PERIOD_SECS,
            bandwidth_limit_kibps: 0,
            install_command: String::new(),
            install_args: Vec::new(),
            auto_install: true,
            data_dir: None,
            download_dir: None,
        }
    }

    /// Resolve the data directory, creating it if missing
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => get_user_data_dir()?,
        };
        if !dir.exists() {
            log::info!("[UpdaterConfig] Creating data directory: {:?}", dir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }
        Ok(dir)
    }

    /// Resolve the download directory, creating it if missing
    pub fn resolve_download_dir(&self) -> Result<PathBuf> {
        let dir = match &self.download_dir {
            Some(dir) => dir.clone(),
            None => self.resolve_data_dir()?.join("downloads"),
        };
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }
        Ok(dir)
    }

    /// Build the outbound check query from configuration and install identity
    pub fn query(&self, running_version: Version, install_id: &str) -> UpdateQuery {
        UpdateQuery {
            channel: self.channel.clone(),
            version: running_version.to_string(),
            platform: self.platform.clone(),
            platform_version: self.platform_version.clone(),
            unique_id: install_id.to_string(),
            willing_to_test: self.willing_to_test,
        }
    }
}

/// Get the user data directory for the updater
/// - macOS: ~/.update-agent/
/// - Windows: %APPDATA%\update-agent\
/// - Linux: ~/.config/update-agent/
pub fn get_user_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?;
        Ok(home.join(".update-agent"))
    }

    #[cfg(not(target_os = "macos"))]
    {
        let config =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))?;
        Ok(config.join("update-agent"))
    }
}

/// Load the stable per-install identifier, generating and persisting one on
/// first use
pub fn load_or_create_install_id(data_dir: &std::path::Path) -> Result<String> {
    let id_path = data_dir.join("install_id");

    if id_path.exists() {
        let id = std::fs::read_to_string(&id_path)
            .with_context(|| format!("Failed to read install id: {:?}", id_path))?;
        let id = id.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
        log::warn!("[UpdaterConfig] Empty install id file, regenerating");
    }

    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&id_path, &id)
        .with_context(|| format!("Failed to write install id: {:?}", id_path))?;
    log::info!("[UpdaterConfig] Generated install id {}", id);
    Ok(id)
}
