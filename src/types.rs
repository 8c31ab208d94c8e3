use serde::{Deserialize, Serialize};

/// Parameters sent with every update check.
///
/// Constructed once from the application's identity and configuration; the
/// checker serializes it straight into the manifest request's query string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQuery {
    pub channel: String,
    /// Running binary version, dotted `major.minor.patch.build`
    pub version: String,
    pub platform: String,
    pub platform_version: String,
    /// Stable per-install identifier
    pub unique_id: String,
    pub willing_to_test: bool,
}

/// Description of an available update, as returned by the manifest service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    /// Package download URL
    pub url: String,
    /// Expected content hash (hex sha-256) of the package
    #[serde(default)]
    pub hash: String,
    /// Target channel; the checker fills this in from the request when the
    /// response omits it
    #[serde(default)]
    pub channel: String,
    /// Target version
    #[serde(default)]
    pub version: String,
    /// Mandatory vs. optional update
    #[serde(default)]
    pub required: bool,
    /// Release notes URL or text
    #[serde(default, alias = "info_url")]
    pub more_info: String,
}

/// Coordinator state machine variable.
///
/// Exactly one instance exists per process. It is never persisted; the marker
/// files are what allow it to be reconstructed after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdaterState {
    Initial,
    CheckingForUpdate,
    UpToDate,
    UpdateAvailable,
    TemporaryError,
    Downloading,
    Installing,
    Failure,
    Terminal,
}

impl std::fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdaterState::Initial => "initial",
            UpdaterState::CheckingForUpdate => "checking-for-update",
            UpdaterState::UpToDate => "up-to-date",
            UpdaterState::UpdateAvailable => "update-available",
            UpdaterState::TemporaryError => "temporary-error",
            UpdaterState::Downloading => "downloading",
            UpdaterState::Installing => "installing",
            UpdaterState::Failure => "failure",
            UpdaterState::Terminal => "terminal",
        };
        write!(f, "{}", name)
    }
}
