//! Mapping store interface
//!
//! The store holds two record kinds: `ThreadBinding`s, reachable by either
//! of their unique keys, and best-effort thread display names. Every
//! operation is atomic at the single-record level; no cross-record
//! transactions are needed.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{BindingKey, RoutingFlags, ThreadBinding};

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Fetch the binding for a thread id or channel id
    async fn get_binding(&self, key: &BindingKey) -> Result<Option<ThreadBinding>, StoreError>;

    /// Insert a new binding.
    ///
    /// Fails with `StoreError::DuplicateKey` when either key is taken.
    async fn create_binding(&self, binding: &ThreadBinding) -> Result<ThreadBinding, StoreError>;

    /// Replace the routing flags of an existing binding.
    /// Returns false when no binding matched.
    async fn update_flags(&self, key: &BindingKey, flags: &RoutingFlags) -> Result<bool, StoreError>;

    /// Remove the binding matching `key`, if any
    async fn destroy_binding(&self, key: &BindingKey) -> Result<(), StoreError>;

    /// All bindings, ordered by creation time
    async fn list_bindings(&self) -> Result<Vec<ThreadBinding>, StoreError>;

    async fn get_thread_name(&self, thread_id: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite the cached display name of a thread
    async fn put_thread_name(&self, thread_id: &str, name: &str) -> Result<(), StoreError>;

    async fn destroy_thread_name(&self, thread_id: &str) -> Result<(), StoreError>;
}
