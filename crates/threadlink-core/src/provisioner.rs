//! Channel provisioning for previously unseen external threads
//!
//! Order of operations: locate the parent category, create the channel,
//! create the named endpoint, persist the binding, seed the name cache.
//! Nothing is persisted until the channel and endpoint exist; a channel
//! whose later steps fail is deleted again.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result, StoreError};
use crate::network::{LocalServer, with_timeout};
use crate::settings::BridgeSettings;
use crate::store::MappingStore;
use crate::types::{BindingKey, ChannelAccess, RoutingFlags, ThreadBinding};

/// Result of a provisioning attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioning {
    /// A new channel and binding were created by this call
    Created(ThreadBinding),
    /// Another task won the create race; this is its binding
    Existing(ThreadBinding),
}

impl Provisioning {
    pub fn binding(&self) -> &ThreadBinding {
        match self {
            Self::Created(b) | Self::Existing(b) => b,
        }
    }

    pub fn into_binding(self) -> ThreadBinding {
        match self {
            Self::Created(b) | Self::Existing(b) => b,
        }
    }
}

pub struct Provisioner {
    store: Arc<dyn MappingStore>,
    local: Arc<dyn LocalServer>,
    settings: Arc<BridgeSettings>,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn MappingStore>,
        local: Arc<dyn LocalServer>,
        settings: Arc<BridgeSettings>,
    ) -> Self {
        Self {
            store,
            local,
            settings,
        }
    }

    /// Create a destination channel and binding for `thread_id`.
    ///
    /// Callers must hold the thread's provisioning lock.
    pub async fn provision(&self, thread_id: &str, display_name: &str) -> Result<Provisioning> {
        let timeout = self.settings.network_timeout;

        let parent_id = self.locate_parent().await?;

        let access = ChannelAccess {
            bridge_id: self.local.bridge_user_id(),
            admin_id: self.settings.admin_id.clone(),
            default_role_id: self.settings.guild_id.clone(),
        };
        let channel_id = with_timeout(
            "create channel",
            timeout,
            self.local.create_channel(&parent_id, display_name, &access),
        )
        .await?;
        debug!("Created channel {} for thread {}", channel_id, thread_id);

        let endpoint = match with_timeout(
            "create webhook",
            timeout,
            self.local
                .create_named_endpoint(&channel_id, &self.settings.bridge_name),
        )
        .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(
                    "Failed to create webhook for channel {} (thread {}): {}",
                    channel_id, thread_id, e
                );
                self.discard_channel(&channel_id).await;
                return Err(e);
            }
        };

        let binding = ThreadBinding::new(
            thread_id,
            channel_id.as_str(),
            RoutingFlags::allowing(self.settings.default_allow),
            endpoint,
        );

        let binding = match self.store.create_binding(&binding).await {
            Ok(created) => created,
            Err(StoreError::DuplicateKey(key)) => {
                info!(
                    "Binding for thread {} was created concurrently ({}), keeping the winner",
                    thread_id, key
                );
                self.discard_channel(&channel_id).await;
                return match self.store.get_binding(&BindingKey::thread(thread_id)).await? {
                    Some(winner) => Ok(Provisioning::Existing(winner)),
                    None => Err(BridgeError::DuplicateBinding { key }),
                };
            }
            Err(e) => {
                self.discard_channel(&channel_id).await;
                return Err(e.into());
            }
        };

        self.seed_thread_name(thread_id, display_name).await;

        info!(
            "Provisioned channel {} for thread {} ({})",
            binding.local_channel_id, thread_id, display_name
        );
        Ok(Provisioning::Created(binding))
    }

    async fn locate_parent(&self) -> Result<String> {
        let containers = with_timeout(
            "list categories",
            self.settings.network_timeout,
            self.local.list_containers(),
        )
        .await?;

        let wanted = self.settings.category_name.to_lowercase();
        containers
            .into_iter()
            .find(|c| c.name.to_lowercase() == wanted)
            .map(|c| c.id)
            .ok_or_else(|| {
                BridgeError::configuration(format!(
                    "category '{}' does not exist in server {}",
                    self.settings.category_name, self.settings.guild_id
                ))
            })
    }

    async fn seed_thread_name(&self, thread_id: &str, name: &str) {
        match self.store.get_thread_name(thread_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.store.put_thread_name(thread_id, name).await {
                    warn!("Failed to cache name of thread {}: {}", thread_id, e);
                }
            }
            Err(e) => warn!("Failed to read cached name of thread {}: {}", thread_id, e),
        }
    }

    /// Best-effort removal of a channel that will not be bound
    async fn discard_channel(&self, channel_id: &str) {
        let result = with_timeout(
            "delete channel",
            self.settings.network_timeout,
            self.local.delete_channel(channel_id),
        )
        .await;
        if let Err(e) = result {
            warn!("Failed to delete unbound channel {}: {}", channel_id, e);
        }
    }
}
