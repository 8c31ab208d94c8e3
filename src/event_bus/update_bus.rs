//! Update Event Bus
//!
//! Lifecycle notifications published by the update core. A UI layer
//! subscribes here to render progress and prompts; the core never waits for
//! a consumer.

use serde::{Deserialize, Serialize};

use super::core::{EventBusContainer, EventBusStats, SubscriptionId};
use crate::types::UpdaterState;

/// Events published by the coordinator, one per transition.
///
/// The serialized form is the §6 wire payload: a `type` tag plus the fields
/// relevant to that transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpdateEvent {
    /// The coordinator moved to a new state
    StateChange { state: UpdaterState },
    /// A check finished; `update_available` distinguishes up-to-date from
    /// update-found, with descriptor fields populated in the latter case
    CheckComplete {
        update_available: bool,
        channel: String,
        version: String,
        required: bool,
        info_url: String,
    },
    /// A check failed (transport error, bad status, malformed manifest)
    CheckError { message: String },
    /// A previously interrupted download was picked up again
    DownloadResume { channel: String, version: String },
    /// A package downloaded and hash-verified; an install marker is on disk
    DownloadComplete {
        channel: String,
        version: String,
        required: bool,
        info_url: String,
    },
    /// A download failed (transport error or hash mismatch)
    DownloadError { message: String },
    /// The installer failed to launch
    InstallError { message: String, required: bool },
}

/// Specialized container for update events
#[derive(Clone, Default)]
pub struct UpdateEventBus {
    inner: EventBusContainer<UpdateEvent>,
}

impl UpdateEventBus {
    pub fn new() -> Self {
        Self {
            inner: EventBusContainer::new(),
        }
    }

    /// Subscribe to all update events
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe(move |event| {
            callback(event);
            true
        })
    }

    /// Subscribe to state transitions only
    pub fn subscribe_state_changes<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&UpdaterState) + Send + Sync + 'static,
    {
        self.inner.subscribe_with_filter(
            move |event| {
                if let UpdateEvent::StateChange { state } = event {
                    callback(state);
                }
                true
            },
            |event| matches!(event, UpdateEvent::StateChange { .. }),
        )
    }

    /// Subscribe to error events only
    pub fn subscribe_errors<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe_with_filter(
            move |event| {
                callback(event);
                true
            },
            |event| {
                matches!(
                    event,
                    UpdateEvent::CheckError { .. }
                        | UpdateEvent::DownloadError { .. }
                        | UpdateEvent::InstallError { .. }
                )
            },
        )
    }

    /// Subscribe to a single update event (one-shot)
    pub fn subscribe_once<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce(&UpdateEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe_once(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Publish an update event to all subscribers
    pub fn publish(&self, event: UpdateEvent) {
        log::trace!("[UpdateEventBus] Publishing event: {:?}", event);
        self.inner.publish(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    pub fn stats(&self) -> EventBusStats {
        self.inner.stats()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
