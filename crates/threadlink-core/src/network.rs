//! Interfaces of the two bridged networks and the attachment fetcher.
//!
//! The core never talks to a concrete SDK; adapters in `threadlink-channels`
//! implement these traits and map SDK failures onto `BridgeError`
//! (`NotFound` for missing remote objects, `Transient` for everything else).

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::types::{
    ChannelAccess, ContainerInfo, ConversationInfo, DeliveryTarget, ExternalPayload,
    FetchedAttachment, LocalPayload,
};

/// The chat network whose threads are bridged in
#[async_trait]
pub trait ExternalNetwork: Send + Sync {
    async fn send(&self, thread_id: &str, payload: ExternalPayload) -> Result<()>;

    async fn conversation_info(&self, thread_id: &str) -> Result<ConversationInfo>;

    /// Set the bridge's own nickname inside a thread
    async fn set_own_nickname(&self, thread_id: &str, name: &str) -> Result<()>;
}

/// The team-chat server hosting destination channels
#[async_trait]
pub trait LocalServer: Send + Sync {
    /// Identity the bridge acts as on the server
    fn bridge_user_id(&self) -> String;

    /// Grouping containers (categories) of the configured server
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Create a text channel under `parent_id`, returning its id
    async fn create_channel(&self, parent_id: &str, name: &str, access: &ChannelAccess) -> Result<String>;

    /// Create a named posting endpoint for a channel.
    /// `Ok(None)` means the platform cannot post under arbitrary names.
    async fn create_named_endpoint(&self, channel_id: &str, name: &str) -> Result<Option<String>>;

    /// Confirm the channel still exists; `NotFound` when it was deleted
    async fn fetch_channel(&self, channel_id: &str) -> Result<()>;

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<()>;

    async fn delete_channel(&self, channel_id: &str) -> Result<()>;

    async fn send(&self, target: &DeliveryTarget, payload: LocalPayload) -> Result<()>;
}

/// Pulls remote attachment bytes for re-upload
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, filename: &str) -> Result<FetchedAttachment>;
}

/// Run one network call with an upper time bound
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let ok = with_timeout("op", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let slow = with_timeout("slow op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(slow, Err(BridgeError::Timeout { ref operation, .. }) if operation == "slow op"));
    }
}
