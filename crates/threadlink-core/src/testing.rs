//! In-memory doubles of the store and both networks for core tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{BridgeError, Result, StoreError};
use crate::network::{AttachmentFetcher, ExternalNetwork, LocalServer};
use crate::settings::BridgeSettings;
use crate::store::MappingStore;
use crate::types::{
    BindingKey, ChannelAccess, ContainerInfo, ConversationInfo, DeliveryTarget, ExternalPayload,
    FetchedAttachment, LocalPayload, RoutingFlags, ThreadBinding,
};

pub fn settings() -> BridgeSettings {
    BridgeSettings::new("Bridge", "admin", "guild").with_network_timeout(Duration::from_secs(2))
}

fn matches_key(binding: &ThreadBinding, key: &BindingKey) -> bool {
    match key {
        BindingKey::Thread(id) => &binding.external_thread_id == id,
        BindingKey::Channel(id) => &binding.local_channel_id == id,
    }
}

#[derive(Default)]
pub struct MockStore {
    bindings: Mutex<Vec<ThreadBinding>>,
    names: Mutex<HashMap<String, String>>,
    inject_before_create: Mutex<Option<ThreadBinding>>,
    fail_reads: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, binding: ThreadBinding) {
        self.bindings.lock().unwrap().push(binding);
    }

    /// Simulate a competing writer landing between lookup and insert
    pub fn inject_before_create(&self, binding: ThreadBinding) {
        *self.inject_before_create.lock().unwrap() = Some(binding);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn seed_thread_name(&self, thread_id: &str, name: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), name.to_string());
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }

    pub fn binding(&self, key: &BindingKey) -> Option<ThreadBinding> {
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .find(|b| matches_key(b, key))
            .cloned()
    }

    pub fn thread_name(&self, thread_id: &str) -> Option<String> {
        self.names.lock().unwrap().get(thread_id).cloned()
    }
}

#[async_trait]
impl MappingStore for MockStore {
    async fn get_binding(&self, key: &BindingKey) -> std::result::Result<Option<ThreadBinding>, StoreError> {
        tokio::task::yield_now().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk on fire".into()));
        }
        Ok(self.binding(key))
    }

    async fn create_binding(&self, binding: &ThreadBinding) -> std::result::Result<ThreadBinding, StoreError> {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(winner) = self.inject_before_create.lock().unwrap().take() {
            bindings.push(winner);
        }
        if bindings.iter().any(|b| {
            b.external_thread_id == binding.external_thread_id
                || b.local_channel_id == binding.local_channel_id
        }) {
            return Err(StoreError::DuplicateKey(format!(
                "thread {}",
                binding.external_thread_id
            )));
        }
        bindings.push(binding.clone());
        Ok(binding.clone())
    }

    async fn update_flags(&self, key: &BindingKey, flags: &RoutingFlags) -> std::result::Result<bool, StoreError> {
        let mut bindings = self.bindings.lock().unwrap();
        match bindings.iter_mut().find(|b| matches_key(b, key)) {
            Some(b) => {
                b.routing_flags = flags.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn destroy_binding(&self, key: &BindingKey) -> std::result::Result<(), StoreError> {
        self.bindings.lock().unwrap().retain(|b| !matches_key(b, key));
        Ok(())
    }

    async fn list_bindings(&self) -> std::result::Result<Vec<ThreadBinding>, StoreError> {
        Ok(self.bindings.lock().unwrap().clone())
    }

    async fn get_thread_name(&self, thread_id: &str) -> std::result::Result<Option<String>, StoreError> {
        Ok(self.thread_name(thread_id))
    }

    async fn put_thread_name(&self, thread_id: &str, name: &str) -> std::result::Result<(), StoreError> {
        self.seed_thread_name(thread_id, name);
        Ok(())
    }

    async fn destroy_thread_name(&self, thread_id: &str) -> std::result::Result<(), StoreError> {
        self.names.lock().unwrap().remove(thread_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CreatedChannel {
    pub parent_id: String,
    pub name: String,
    pub access: ChannelAccess,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EndpointMode {
    Supported,
    Unsupported,
    Failing,
}

pub struct MockLocal {
    containers: Vec<ContainerInfo>,
    endpoints: EndpointMode,
    next_id: AtomicUsize,
    created: Mutex<Vec<CreatedChannel>>,
    deleted: Mutex<Vec<String>>,
    missing: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    renamed: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<(DeliveryTarget, LocalPayload)>>,
}

impl MockLocal {
    pub fn new() -> Self {
        Self {
            containers: vec![
                ContainerInfo {
                    id: "cat-0".into(),
                    name: "general".into(),
                },
                ContainerInfo {
                    id: "cat-1".into(),
                    name: "Facebook".into(),
                },
            ],
            endpoints: EndpointMode::Supported,
            next_id: AtomicUsize::new(1),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            missing: Mutex::new(HashSet::new()),
            unreachable: AtomicBool::new(false),
            renamed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_containers(mut self, containers: &[(&str, &str)]) -> Self {
        self.containers = containers
            .iter()
            .map(|(id, name)| ContainerInfo {
                id: id.to_string(),
                name: name.to_string(),
            })
            .collect();
        self
    }

    pub fn without_endpoints(mut self) -> Self {
        self.endpoints = EndpointMode::Unsupported;
        self
    }

    pub fn failing_endpoints(mut self) -> Self {
        self.endpoints = EndpointMode::Failing;
        self
    }

    /// Make the channel look deleted from now on
    pub fn remove_channel(&self, channel_id: &str) {
        self.missing.lock().unwrap().insert(channel_id.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn created_channels(&self) -> Vec<CreatedChannel> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_channels(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn renamed(&self) -> Vec<(String, String)> {
        self.renamed.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(DeliveryTarget, LocalPayload)> {
        self.sent.lock().unwrap().clone()
    }

    fn check_reachable(&self, operation: &str, channel_id: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::transient(operation, "connection reset"));
        }
        if self.missing.lock().unwrap().contains(channel_id) {
            return Err(BridgeError::not_found(format!("channel {}", channel_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalServer for MockLocal {
    fn bridge_user_id(&self) -> String {
        "bridge-bot".to_string()
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers.clone())
    }

    async fn create_channel(&self, parent_id: &str, name: &str, access: &ChannelAccess) -> Result<String> {
        // Widen the window in which concurrent provisioning could interleave
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = format!("chan-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(CreatedChannel {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            access: access.clone(),
        });
        Ok(id)
    }

    async fn create_named_endpoint(&self, channel_id: &str, _name: &str) -> Result<Option<String>> {
        match self.endpoints {
            EndpointMode::Supported => Ok(Some(format!("https://hooks.test/{}", channel_id))),
            EndpointMode::Unsupported => Ok(None),
            EndpointMode::Failing => Err(BridgeError::transient("create webhook", "missing permission")),
        }
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<()> {
        self.check_reachable("fetch channel", channel_id)
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<()> {
        self.check_reachable("rename channel", channel_id)?;
        self.renamed
            .lock()
            .unwrap()
            .push((channel_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(channel_id.to_string());
        Ok(())
    }

    async fn send(&self, target: &DeliveryTarget, payload: LocalPayload) -> Result<()> {
        self.sent.lock().unwrap().push((target.clone(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockExternal {
    names: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<(String, ExternalPayload)>>,
    nicknames: Mutex<Vec<(String, String)>>,
    fail_send: AtomicBool,
    fail_nickname: AtomicBool,
}

impl MockExternal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name(self, thread_id: &str, name: &str) -> Self {
        self.names
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), name.to_string());
        self
    }

    pub fn fail_send(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn fail_nickname(&self) {
        self.fail_nickname.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, ExternalPayload)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn nicknames(&self) -> Vec<(String, String)> {
        self.nicknames.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalNetwork for MockExternal {
    async fn send(&self, thread_id: &str, payload: ExternalPayload) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(BridgeError::transient("send message", "session expired"));
        }
        self.sent.lock().unwrap().push((thread_id.to_string(), payload));
        Ok(())
    }

    async fn conversation_info(&self, thread_id: &str) -> Result<ConversationInfo> {
        Ok(ConversationInfo {
            display_name: self.names.lock().unwrap().get(thread_id).cloned(),
        })
    }

    async fn set_own_nickname(&self, thread_id: &str, name: &str) -> Result<()> {
        if self.fail_nickname.load(Ordering::SeqCst) {
            return Err(BridgeError::transient("set nickname", "not permitted"));
        }
        self.nicknames
            .lock()
            .unwrap()
            .push((thread_id.to_string(), name.to_string()));
        Ok(())
    }
}

/// Serves the URL itself as the file body; URLs containing "broken" fail
/// Fails on URLs containing `broken`, stalls on URLs containing `slow`
pub struct MockFetcher;

#[async_trait]
impl AttachmentFetcher for MockFetcher {
    async fn fetch(&self, url: &str, filename: &str) -> Result<FetchedAttachment> {
        if url.contains("broken") {
            return Err(BridgeError::transient("fetch attachment", "404 from cdn"));
        }
        if url.contains("slow") {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(FetchedAttachment {
            filename: filename.to_string(),
            content_type: None,
            data: url.as_bytes().to_vec(),
        })
    }
}
