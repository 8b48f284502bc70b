//! threadlink-core - Routing heart of the threadlink bridge
//!
//! This crate provides:
//! - Event router relaying messages between Messenger threads and Discord channels
//! - On-demand channel provisioning with per-thread single-flight locking
//! - Routing policy shared by both relay directions
//! - Payload translation between the two networks
//! - Traits for the mapping store, both networks and the attachment fetcher

pub mod error;
pub mod network;
pub mod policy;
pub mod provisioner;
pub mod router;
pub mod settings;
pub mod singleflight;
pub mod store;
pub mod translator;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use error::{BridgeError, Result, StoreError};
pub use network::{AttachmentFetcher, ExternalNetwork, LocalServer, with_timeout};
pub use provisioner::{Provisioner, Provisioning};
pub use router::{IgnoreReason, RelayOutcome, Router};
pub use settings::{BridgeSettings, FirstMessagePolicy};
pub use store::MappingStore;
pub use types::{
    BindingKey, BridgeEvent, ChannelAccess, ContainerInfo, ConversationInfo, DeliveryTarget,
    EmbedSpec, ExternalAttachment, ExternalEvent, ExternalMessage, ExternalPayload,
    FetchedAttachment, FileUpload, LocalAttachment, LocalEvent, LocalMessage, LocalPayload,
    RoutingFlags, ThreadBinding,
};
