//! Event Bus System
//!
//! Publish-subscribe plumbing between the update core and whatever renders
//! it. The core never blocks on a consumer; publishing walks the current
//! subscriber list synchronously and drops one-shot subscriptions afterwards.

pub mod core;
pub mod update_bus;

pub use core::{EventBus, EventBusContainer, EventBusStats, SubscriptionId};
pub use update_bus::{UpdateEvent, UpdateEventBus};
