use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::types::{UpdateDescriptor, UpdateQuery};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a single update check
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// No update available (current version is latest)
    NoUpdate,
    /// Update available with its download descriptor
    Available(UpdateDescriptor),
    /// Error occurred while checking
    Error(String),
}

/// Queries the manifest endpoint for available updates.
///
/// Performs exactly one network call per [`check`](Self::check); retry timing
/// is entirely the coordinator's responsibility.
#[derive(Clone)]
pub struct VersionChecker {
    check_url: String,
    client: Client,
}

impl VersionChecker {
    pub fn new(check_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(check_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(check_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("update-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            check_url: check_url.into(),
            client,
        })
    }

    /// Check for an available update.
    ///
    /// Transport failures, non-2xx statuses, and unparseable manifests all
    /// come back as [`CheckOutcome::Error`]; they are never raised.
    pub async fn check(&self, query: &UpdateQuery) -> CheckOutcome {
        log::debug!(
            "[VersionChecker] Checking {} (channel {}, version {})",
            self.check_url,
            query.channel,
            query.version
        );

        let response = match self.client.get(&self.check_url).query(query).send().await {
            Ok(response) => response,
            Err(err) => {
                log::error!("[VersionChecker] Request failed: {}", err);
                return CheckOutcome::Error(err.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            log::error!("[VersionChecker] Manifest service returned {}", status);
            return CheckOutcome::Error(format!("manifest service returned {}", status));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                log::error!("[VersionChecker] Failed to read response body: {}", err);
                return CheckOutcome::Error(err.to_string());
            }
        };

        let outcome = parse_check_response(&body, &query.channel);
        match &outcome {
            CheckOutcome::NoUpdate => log::info!("[VersionChecker] No update available"),
            CheckOutcome::Available(descriptor) => log::info!(
                "[VersionChecker] Update available: {} ({})",
                descriptor.version,
                descriptor.channel
            ),
            CheckOutcome::Error(message) => {
                log::error!("[VersionChecker] Bad manifest: {}", message)
            }
        }
        outcome
    }
}

/// Parse a manifest response body.
///
/// Empty/falsey bodies mean no update; an object carrying `url` and a content
/// `hash` is an update descriptor (with `channel` defaulted to the requesting
/// channel when omitted); anything else is a malformed manifest.
fn parse_check_response(body: &str, requesting_channel: &str) -> CheckOutcome {
    let body = body.trim();
    if body.is_empty() {
        return CheckOutcome::NoUpdate;
    }

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => return CheckOutcome::Error(format!("malformed manifest: {}", err)),
    };

    match &value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => return CheckOutcome::NoUpdate,
        serde_json::Value::Object(map) if map.is_empty() => return CheckOutcome::NoUpdate,
        serde_json::Value::Object(map) if map.contains_key("url") => {}
        _ => {
            return CheckOutcome::Error(format!("unexpected manifest shape: {}", value));
        }
    }

    match serde_json::from_value::<UpdateDescriptor>(value) {
        Ok(mut descriptor) => {
            // The content hash is the only integrity check the package gets;
            // an update offer without one is not actionable
            if descriptor.hash.is_empty() {
                return CheckOutcome::Error("malformed manifest: missing content hash".to_string());
            }
            if descriptor.channel.is_empty() {
                descriptor.channel = requesting_channel.to_string();
            }
            CheckOutcome::Available(descriptor)
        }
        Err(err) => CheckOutcome::Error(format!("malformed manifest: {}", err)),
    }
}
