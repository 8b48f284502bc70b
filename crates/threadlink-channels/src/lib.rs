//! Network adapters and event bus for threadlink
//!
//! This crate provides the inbound event bus plus concrete adapters for
//! Discord (local server) and the Messenger session gateway (external
//! network), an HTTP attachment fetcher and the session health monitor.

pub mod bus;
pub mod discord;
pub mod fetch;
pub mod health;
pub mod messenger;

// Re-export main types
pub use bus::{EventBus, EventSource, SourceKind};
pub use discord::{ActivityKind, DiscordServer, Presence};
pub use fetch::HttpAttachmentFetcher;
pub use health::{HealthMonitor, SessionHealth};
pub use messenger::MessengerClient;
