//! Event routing between the external network and the local server
//!
//! `Router::dispatch` is the single entry point for every inbound event.
//! Each call runs to completion independently; the only cross-event
//! coordination is the per-thread provisioning lock. Failures never
//! escape `dispatch`; they come back as `RelayOutcome::Failed` after
//! being logged.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::network::{AttachmentFetcher, ExternalNetwork, LocalServer, with_timeout};
use crate::policy;
use crate::provisioner::{Provisioner, Provisioning};
use crate::settings::{BridgeSettings, FirstMessagePolicy};
use crate::singleflight::ProvisionLocks;
use crate::store::MappingStore;
use crate::translator;
use crate::types::{
    BindingKey, BridgeEvent, ExternalEvent, ExternalMessage, ExternalPayload, FetchedAttachment,
    LocalAttachment, LocalEvent, LocalMessage, ThreadBinding,
};

/// Why an event produced no relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Posted by the bridge itself (bot user or its webhooks)
    BridgeAuthor,
    /// Message from a server other than the configured one
    ForeignGuild,
    /// No binding exists for the thread or channel
    Unbound,
    /// Routing flags refused the relay
    PolicyDenied,
}

/// What handling one event amounted to
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// Message relayed to the other network
    Delivered,
    /// A new channel and binding were created for the thread
    Provisioned { channel_id: String, delivered: bool },
    /// Channel renamed, nickname applied or binding already present
    Updated,
    /// A binding was destroyed
    Cleaned,
    Ignored(IgnoreReason),
    Failed(BridgeError),
}

impl RelayOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

pub struct Router {
    store: Arc<dyn MappingStore>,
    local: Arc<dyn LocalServer>,
    external: Arc<dyn ExternalNetwork>,
    fetcher: Arc<dyn AttachmentFetcher>,
    settings: Arc<BridgeSettings>,
    provisioner: Provisioner,
    locks: ProvisionLocks,
}

impl Router {
    pub fn new(
        store: Arc<dyn MappingStore>,
        local: Arc<dyn LocalServer>,
        external: Arc<dyn ExternalNetwork>,
        fetcher: Arc<dyn AttachmentFetcher>,
        settings: Arc<BridgeSettings>,
    ) -> Self {
        let provisioner = Provisioner::new(store.clone(), local.clone(), settings.clone());
        Self {
            store,
            local,
            external,
            fetcher,
            settings,
            provisioner,
            locks: ProvisionLocks::new(),
        }
    }

    pub fn settings(&self) -> &Arc<BridgeSettings> {
        &self.settings
    }

    /// Flip the process-wide relay override. Returns the previous value.
    pub fn set_global_relay(&self, enabled: bool) -> bool {
        let previous = self.settings.set_global_relay(enabled);
        if previous != enabled {
            info!("Global relay {}", if enabled { "enabled" } else { "disabled" });
        }
        previous
    }

    /// Periodic maintenance: drops idle provisioning locks
    pub fn housekeeping(&self) -> usize {
        self.locks.prune()
    }

    /// Handle one inbound event
    pub async fn dispatch(&self, event: BridgeEvent) -> RelayOutcome {
        let label = event.to_string();
        let result = match event {
            BridgeEvent::External(ExternalEvent::Message(msg)) => self.external_message(msg).await,
            BridgeEvent::External(ExternalEvent::Subscribe { thread_id }) => {
                self.subscribe(&thread_id).await
            }
            BridgeEvent::External(ExternalEvent::Unsubscribe { thread_id }) => {
                self.unsubscribe(&thread_id).await
            }
            BridgeEvent::External(ExternalEvent::Rename { thread_id, name }) => {
                self.rename(&thread_id, &name).await
            }
            BridgeEvent::Local(LocalEvent::Message(msg)) => self.local_message(msg).await,
            BridgeEvent::Local(LocalEvent::ChannelDeleted { channel_id }) => {
                self.channel_deleted(&channel_id).await
            }
        };

        match result {
            Ok(outcome) => {
                debug!("Handled {}: {:?}", label, outcome);
                outcome
            }
            Err(e) => {
                error!("Failed to handle {}: {}", label, e);
                RelayOutcome::Failed(e)
            }
        }
    }

    async fn external_message(&self, msg: ExternalMessage) -> Result<RelayOutcome> {
        let binding = match self.lookup(&BindingKey::thread(&msg.thread_id)).await? {
            Some(binding) => binding,
            None => match self.ensure_binding(&msg.thread_id).await? {
                Provisioning::Created(binding) => {
                    return self.first_message(binding, &msg).await;
                }
                Provisioning::Existing(binding) => binding,
            },
        };

        match self.verify_channel(&binding).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.drop_dangling(&binding).await;
                return Ok(RelayOutcome::Cleaned);
            }
            Err(e) => return Err(e),
        }

        if !policy::allowed(&binding, self.settings.global_relay(), Some(&msg.sender_id)) {
            debug!(
                "Relay from thread {} (sender {}) refused by policy",
                msg.thread_id, msg.sender_id
            );
            return Ok(RelayOutcome::Ignored(IgnoreReason::PolicyDenied));
        }

        self.deliver_local(&binding, &msg).await?;
        Ok(RelayOutcome::Delivered)
    }

    /// The message that triggered provisioning of `binding`
    async fn first_message(&self, binding: ThreadBinding, msg: &ExternalMessage) -> Result<RelayOutcome> {
        let channel_id = binding.local_channel_id.clone();
        let deliver = self.settings.first_message == FirstMessagePolicy::Deliver
            && policy::allowed(&binding, self.settings.global_relay(), Some(&msg.sender_id));
        if deliver {
            self.deliver_local(&binding, msg).await?;
        }
        Ok(RelayOutcome::Provisioned {
            channel_id,
            delivered: deliver,
        })
    }

    async fn deliver_local(&self, binding: &ThreadBinding, msg: &ExternalMessage) -> Result<()> {
        let mut payload = translator::to_local(msg, binding.delivery_endpoint.is_some());

        // Each file gets its own timeout; the send below only covers posting
        let files = std::mem::take(&mut payload.files);
        let mut dropped = Vec::new();
        for file in &files {
            match self.fetch_one(&file.url, &file.filename).await {
                Some(fetched) => payload.uploads.push(fetched),
                None => dropped.push(file.filename.as_str()),
            }
        }
        if !dropped.is_empty() {
            let notice = translator::dropped_files_notice(&dropped);
            payload.content = translator::join_lines(&payload.content, &notice);
        }

        let target = binding.delivery_target();
        with_timeout(
            "deliver to channel",
            self.settings.network_timeout,
            self.local.send(&target, payload),
        )
        .await
        .inspect_err(|e| {
            warn!(
                "Delivery from thread {} to channel {} failed: {}",
                binding.external_thread_id, binding.local_channel_id, e
            )
        })
    }

    /// Find or create the binding for `thread_id` under its provisioning lock
    async fn ensure_binding(&self, thread_id: &str) -> Result<Provisioning> {
        let _guard = self.locks.acquire(thread_id).await;

        // Someone else may have finished provisioning while we waited
        if let Some(binding) = self.lookup(&BindingKey::thread(thread_id)).await? {
            return Ok(Provisioning::Existing(binding));
        }

        let name = self.resolve_name(thread_id).await;
        self.provisioner.provision(thread_id, &name).await
    }

    /// Cached name, then the network's name, then a synthetic fallback
    async fn resolve_name(&self, thread_id: &str) -> String {
        match self.store.get_thread_name(thread_id).await {
            Ok(Some(name)) if !name.trim().is_empty() => return name,
            Ok(_) => {}
            Err(e) => warn!("Failed to read cached name of thread {}: {}", thread_id, e),
        }

        match with_timeout(
            "fetch thread info",
            self.settings.network_timeout,
            self.external.conversation_info(thread_id),
        )
        .await
        {
            Ok(info) => {
                if let Some(name) = info.display_name.filter(|n| !n.trim().is_empty()) {
                    return name;
                }
            }
            Err(e) => debug!("No display name for thread {}: {}", thread_id, e),
        }

        self.settings.fallback_name(thread_id)
    }

    /// Provisioning and the nickname are independent; the nickname is
    /// attempted even when provisioning fails.
    async fn subscribe(&self, thread_id: &str) -> Result<RelayOutcome> {
        let outcome = match self.lookup(&BindingKey::thread(thread_id)).await {
            Ok(Some(_)) => Ok(RelayOutcome::Updated),
            Ok(None) => self.ensure_binding(thread_id).await.map(|p| match p {
                Provisioning::Created(binding) => RelayOutcome::Provisioned {
                    channel_id: binding.local_channel_id,
                    delivered: false,
                },
                Provisioning::Existing(_) => RelayOutcome::Updated,
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = with_timeout(
            "set nickname",
            self.settings.network_timeout,
            self.external
                .set_own_nickname(thread_id, &self.settings.bridge_name),
        )
        .await
        {
            warn!("Failed to set bridge nickname in thread {}: {}", thread_id, e);
        }

        outcome
    }

    async fn unsubscribe(&self, thread_id: &str) -> Result<RelayOutcome> {
        let key = BindingKey::thread(thread_id);
        if self.lookup(&key).await?.is_none() {
            return Ok(RelayOutcome::Ignored(IgnoreReason::Unbound));
        }

        self.store.destroy_binding(&key).await?;
        if let Err(e) = self.store.destroy_thread_name(thread_id).await {
            warn!("Failed to drop cached name of thread {}: {}", thread_id, e);
        }
        info!("Bridge left thread {}, binding removed", thread_id);
        Ok(RelayOutcome::Cleaned)
    }

    async fn rename(&self, thread_id: &str, name: &str) -> Result<RelayOutcome> {
        if let Err(e) = self.store.put_thread_name(thread_id, name).await {
            warn!("Failed to cache name of thread {}: {}", thread_id, e);
        }

        let Some(binding) = self.lookup(&BindingKey::thread(thread_id)).await? else {
            return Ok(RelayOutcome::Ignored(IgnoreReason::Unbound));
        };

        match with_timeout(
            "rename channel",
            self.settings.network_timeout,
            self.local.rename_channel(&binding.local_channel_id, name),
        )
        .await
        {
            Ok(()) => {
                info!(
                    "Renamed channel {} to '{}' (thread {})",
                    binding.local_channel_id, name, thread_id
                );
                Ok(RelayOutcome::Updated)
            }
            Err(e) if e.is_not_found() => {
                self.drop_dangling(&binding).await;
                Ok(RelayOutcome::Cleaned)
            }
            Err(e) => Err(e),
        }
    }

    async fn local_message(&self, msg: LocalMessage) -> Result<RelayOutcome> {
        if msg.is_bridge_author {
            return Ok(RelayOutcome::Ignored(IgnoreReason::BridgeAuthor));
        }
        if msg.guild_id.as_deref() != Some(self.settings.guild_id.as_str()) {
            return Ok(RelayOutcome::Ignored(IgnoreReason::ForeignGuild));
        }

        let Some(binding) = self.lookup(&BindingKey::channel(&msg.channel_id)).await? else {
            return Ok(RelayOutcome::Ignored(IgnoreReason::Unbound));
        };

        if !policy::allowed(&binding, self.settings.global_relay(), Some(&msg.author_id)) {
            debug!(
                "Relay from channel {} (author {}) refused by policy",
                msg.channel_id, msg.author_id
            );
            return Ok(RelayOutcome::Ignored(IgnoreReason::PolicyDenied));
        }

        let draft = translator::to_external_draft(&msg);
        let payload = ExternalPayload {
            body: draft.body,
            attachments: self.fetch_attachments(&draft.attachment_urls).await,
        };

        with_timeout(
            "send to thread",
            self.settings.network_timeout,
            self.external.send(&binding.external_thread_id, payload),
        )
        .await
        .inspect_err(|e| {
            warn!(
                "Delivery from channel {} to thread {} failed: {}",
                binding.local_channel_id, binding.external_thread_id, e
            )
        })?;
        Ok(RelayOutcome::Delivered)
    }

    /// Pull every attachment; failed ones are skipped
    async fn fetch_attachments(&self, attachments: &[LocalAttachment]) -> Vec<FetchedAttachment> {
        let mut fetched = Vec::with_capacity(attachments.len());
        for att in attachments {
            if let Some(file) = self.fetch_one(&att.url, &att.filename).await {
                fetched.push(file);
            }
        }
        fetched
    }

    async fn fetch_one(&self, url: &str, filename: &str) -> Option<FetchedAttachment> {
        with_timeout(
            "fetch attachment",
            self.settings.network_timeout,
            self.fetcher.fetch(url, filename),
        )
        .await
        .inspect_err(|e| warn!("Dropping attachment {}: {}", filename, e))
        .ok()
    }

    async fn channel_deleted(&self, channel_id: &str) -> Result<RelayOutcome> {
        let key = BindingKey::channel(channel_id);
        let Some(binding) = self.lookup(&key).await? else {
            return Ok(RelayOutcome::Ignored(IgnoreReason::Unbound));
        };
        self.store.destroy_binding(&key).await?;
        info!(
            "Channel {} deleted, unbound thread {}",
            channel_id, binding.external_thread_id
        );
        Ok(RelayOutcome::Cleaned)
    }

    async fn verify_channel(&self, binding: &ThreadBinding) -> Result<()> {
        with_timeout(
            "fetch channel",
            self.settings.network_timeout,
            self.local.fetch_channel(&binding.local_channel_id),
        )
        .await
    }

    /// Remove a binding whose channel no longer exists
    async fn drop_dangling(&self, binding: &ThreadBinding) {
        warn!(
            "Channel {} of thread {} is gone, removing binding",
            binding.local_channel_id, binding.external_thread_id
        );
        let key = BindingKey::thread(&binding.external_thread_id);
        if let Err(e) = self.store.destroy_binding(&key).await {
            error!("Failed to remove dangling binding for {}: {}", key, e);
        }
    }

    async fn lookup(&self, key: &BindingKey) -> Result<Option<ThreadBinding>> {
        Ok(self.store.get_binding(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExternal, MockFetcher, MockLocal, MockStore, settings};
    use std::time::Duration;
    use crate::types::{AttachmentKind, DeliveryTarget, ExternalAttachment, RoutingFlags};

    struct Harness {
        store: Arc<MockStore>,
        local: Arc<MockLocal>,
        external: Arc<MockExternal>,
        router: Arc<Router>,
    }

    fn harness_with(settings: BridgeSettings, local: MockLocal, external: MockExternal) -> Harness {
        let store = Arc::new(MockStore::new());
        let local = Arc::new(local);
        let external = Arc::new(external);
        let router = Arc::new(Router::new(
            store.clone(),
            local.clone(),
            external.clone(),
            Arc::new(MockFetcher),
            Arc::new(settings),
        ));
        Harness {
            store,
            local,
            external,
            router,
        }
    }

    fn harness() -> Harness {
        harness_with(settings(), MockLocal::new(), MockExternal::new())
    }

    fn ext_message(thread: &str, sender: &str, body: &str) -> BridgeEvent {
        BridgeEvent::External(ExternalEvent::Message(ExternalMessage {
            thread_id: thread.to_string(),
            sender_id: sender.to_string(),
            sender_name: Some("Alice".to_string()),
            body: body.to_string(),
            attachments: vec![],
        }))
    }

    fn local_message(channel: &str, author: &str, body: &str) -> LocalMessage {
        LocalMessage {
            channel_id: channel.to_string(),
            guild_id: Some("guild".to_string()),
            author_id: author.to_string(),
            author_tag: "bob#0001".to_string(),
            is_bridge_author: false,
            body: body.to_string(),
            attachments: vec![],
        }
    }

    fn local_event(msg: LocalMessage) -> BridgeEvent {
        BridgeEvent::Local(LocalEvent::Message(msg))
    }

    fn bound(h: &Harness, thread: &str, channel: &str, allow: bool) -> ThreadBinding {
        let binding = ThreadBinding::new(
            thread,
            channel,
            RoutingFlags::allowing(allow),
            Some(format!("https://hooks.test/{}", channel)),
        );
        h.store.insert(binding.clone());
        binding
    }

    #[tokio::test]
    async fn test_first_message_provisions_then_relays() {
        let h = harness_with(
            settings(),
            MockLocal::new(),
            MockExternal::new().with_thread_name("T1", "Family"),
        );

        let first = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        let RelayOutcome::Provisioned { channel_id, delivered } = first else {
            panic!("expected provisioning, got {:?}", first);
        };
        assert!(!delivered);
        assert!(h.local.sent().is_empty());
        assert_eq!(h.local.created_channels()[0].name, "Family");

        let binding = h.store.binding(&BindingKey::thread("T1")).unwrap();
        assert_eq!(binding.local_channel_id, channel_id);

        let second = h.router.dispatch(ext_message("T1", "100", "hello")).await;
        assert!(matches!(second, RelayOutcome::Delivered));
        let sent = h.local.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0,
            DeliveryTarget::Endpoint(format!("https://hooks.test/{}", channel_id))
        );
        assert_eq!(sent[0].1.content, "hello");
        assert_eq!(sent[0].1.username.as_deref(), Some("Alice (100)"));
        assert_eq!(sent[0].1.embeds[0].footer.as_deref(), Some("thread T1"));
        assert_eq!(h.local.created_channels().len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_policy_relays_triggering_message() {
        let h = harness_with(
            settings().with_first_message(FirstMessagePolicy::Deliver),
            MockLocal::new(),
            MockExternal::new(),
        );
        let outcome = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(outcome, RelayOutcome::Provisioned { delivered: true, .. }));
        assert_eq!(h.local.sent().len(), 1);
        assert_eq!(h.local.sent()[0].1.content, "hi");
    }

    #[tokio::test]
    async fn test_concurrent_first_messages_provision_once() {
        let h = harness();
        let mut handles = Vec::new();
        for i in 0..10 {
            let router = h.router.clone();
            handles.push(tokio::spawn(async move {
                router.dispatch(ext_message("T1", "100", &format!("m{}", i))).await
            }));
        }

        let mut provisioned = 0;
        for handle in handles {
            match handle.await.unwrap() {
                RelayOutcome::Provisioned { .. } => provisioned += 1,
                RelayOutcome::Delivered => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(provisioned, 1);
        assert_eq!(h.local.created_channels().len(), 1);
        assert_eq!(h.store.binding_count(), 1);
        assert_eq!(h.local.sent().len(), 9);
        assert!(h.local.deleted_channels().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_threads_get_distinct_channels() {
        let h = harness();
        h.router.dispatch(ext_message("T1", "100", "a")).await;
        h.router.dispatch(ext_message("T2", "100", "b")).await;

        let t1 = h.store.binding(&BindingKey::thread("T1")).unwrap();
        let t2 = h.store.binding(&BindingKey::thread("T2")).unwrap();
        assert_ne!(t1.local_channel_id, t2.local_channel_id);
    }

    #[tokio::test]
    async fn test_missing_channel_drops_binding_and_reprovisions() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        h.local.remove_channel("C1");

        let outcome = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(outcome, RelayOutcome::Cleaned));
        assert!(h.store.binding(&BindingKey::thread("T1")).is_none());
        assert!(h.local.sent().is_empty());

        let next = h.router.dispatch(ext_message("T1", "100", "again")).await;
        assert!(matches!(next, RelayOutcome::Provisioned { .. }));
        assert_eq!(h.store.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_binding() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        h.local.set_unreachable(true);

        let outcome = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(outcome.is_failure());
        assert!(h.store.binding(&BindingKey::thread("T1")).is_some());
    }

    #[tokio::test]
    async fn test_policy_applies_in_both_directions() {
        let h = harness();
        bound(&h, "T1", "C1", false);

        let inbound = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(inbound, RelayOutcome::Ignored(IgnoreReason::PolicyDenied)));
        let outbound = h.router.dispatch(local_event(local_message("C1", "200", "yo"))).await;
        assert!(matches!(outbound, RelayOutcome::Ignored(IgnoreReason::PolicyDenied)));

        assert!(!h.router.set_global_relay(true));

        let inbound = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(inbound, RelayOutcome::Delivered));
        let outbound = h.router.dispatch(local_event(local_message("C1", "200", "yo"))).await;
        assert!(matches!(outbound, RelayOutcome::Delivered));
    }

    #[tokio::test]
    async fn test_deny_list_blocks_sender_only() {
        let h = harness();
        let mut flags = RoutingFlags::allowing(true);
        flags.deny_list.insert("666".to_string());
        h.store.insert(ThreadBinding::new("T1", "C1", flags, None));

        let denied = h.router.dispatch(ext_message("T1", "666", "spam")).await;
        assert!(matches!(denied, RelayOutcome::Ignored(IgnoreReason::PolicyDenied)));
        let allowed = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(allowed, RelayOutcome::Delivered));
        assert_eq!(h.local.sent()[0].0, DeliveryTarget::Channel("C1".to_string()));
    }

    #[tokio::test]
    async fn test_missing_category_fails_without_side_effects() {
        let h = harness_with(
            settings(),
            MockLocal::new().with_containers(&[("cat-0", "general")]),
            MockExternal::new(),
        );
        let outcome = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(
            outcome,
            RelayOutcome::Failed(BridgeError::Configuration { .. })
        ));
        assert!(h.local.created_channels().is_empty());
        assert_eq!(h.store.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_store_read_failure_aborts_without_provisioning() {
        let h = harness();
        h.store.fail_reads();
        let outcome = h.router.dispatch(ext_message("T1", "100", "hi")).await;
        assert!(matches!(outcome, RelayOutcome::Failed(BridgeError::Store { .. })));
        assert!(h.local.created_channels().is_empty());
    }

    #[tokio::test]
    async fn test_channel_name_resolution_order() {
        let h = harness_with(
            settings(),
            MockLocal::new(),
            MockExternal::new().with_thread_name("T2", "From network"),
        );
        h.store.seed_thread_name("T1", "From cache");

        h.router.dispatch(ext_message("T1", "100", "a")).await;
        h.router.dispatch(ext_message("T2", "100", "b")).await;
        h.router.dispatch(ext_message("T3", "100", "c")).await;

        let names: Vec<String> = h
            .local
            .created_channels()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["From cache", "From network", "User T3"]);
    }

    #[tokio::test]
    async fn test_subscribe_provisions_and_sets_nickname() {
        let h = harness();
        let event = BridgeEvent::External(ExternalEvent::Subscribe {
            thread_id: "T1".to_string(),
        });
        let outcome = h.router.dispatch(event.clone()).await;
        assert!(matches!(outcome, RelayOutcome::Provisioned { delivered: false, .. }));
        assert_eq!(h.external.nicknames(), vec![("T1".to_string(), "Bridge".to_string())]);

        let again = h.router.dispatch(event).await;
        assert!(matches!(again, RelayOutcome::Updated));
        assert_eq!(h.local.created_channels().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sets_nickname_when_provisioning_fails() {
        let h = harness_with(
            settings(),
            MockLocal::new().with_containers(&[("cat-0", "general")]),
            MockExternal::new(),
        );
        let outcome = h
            .router
            .dispatch(BridgeEvent::External(ExternalEvent::Subscribe {
                thread_id: "T1".to_string(),
            }))
            .await;
        assert!(matches!(
            outcome,
            RelayOutcome::Failed(BridgeError::Configuration { .. })
        ));
        assert_eq!(h.external.nicknames(), vec![("T1".to_string(), "Bridge".to_string())]);
        assert_eq!(h.store.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_nickname_failure_is_not_fatal() {
        let h = harness();
        h.external.fail_nickname();
        let outcome = h
            .router
            .dispatch(BridgeEvent::External(ExternalEvent::Subscribe {
                thread_id: "T1".to_string(),
            }))
            .await;
        assert!(matches!(outcome, RelayOutcome::Provisioned { .. }));
        assert_eq!(h.store.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_binding_and_name() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        h.store.seed_thread_name("T1", "Family");

        let event = BridgeEvent::External(ExternalEvent::Unsubscribe {
            thread_id: "T1".to_string(),
        });
        assert!(matches!(h.router.dispatch(event.clone()).await, RelayOutcome::Cleaned));
        assert_eq!(h.store.binding_count(), 0);
        assert!(h.store.thread_name("T1").is_none());

        assert!(matches!(
            h.router.dispatch(event).await,
            RelayOutcome::Ignored(IgnoreReason::Unbound)
        ));
    }

    #[tokio::test]
    async fn test_rename_updates_channel_and_cache() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        let outcome = h
            .router
            .dispatch(BridgeEvent::External(ExternalEvent::Rename {
                thread_id: "T1".to_string(),
                name: "Renamed".to_string(),
            }))
            .await;

        assert!(matches!(outcome, RelayOutcome::Updated));
        assert_eq!(h.local.renamed(), vec![("C1".to_string(), "Renamed".to_string())]);
        assert_eq!(h.store.thread_name("T1").as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn test_rename_of_deleted_channel_drops_binding() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        h.local.remove_channel("C1");

        let outcome = h
            .router
            .dispatch(BridgeEvent::External(ExternalEvent::Rename {
                thread_id: "T1".to_string(),
                name: "Renamed".to_string(),
            }))
            .await;
        assert!(matches!(outcome, RelayOutcome::Cleaned));
        assert_eq!(h.store.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_rename_of_unbound_thread_only_caches_name() {
        let h = harness();
        let outcome = h
            .router
            .dispatch(BridgeEvent::External(ExternalEvent::Rename {
                thread_id: "T9".to_string(),
                name: "Later".to_string(),
            }))
            .await;
        assert!(matches!(outcome, RelayOutcome::Ignored(IgnoreReason::Unbound)));
        assert!(h.local.renamed().is_empty());
        assert_eq!(h.store.thread_name("T9").as_deref(), Some("Later"));
    }

    #[tokio::test]
    async fn test_local_message_relayed_with_author_tag() {
        let h = harness();
        bound(&h, "T1", "C1", true);

        let mut msg = local_message("C1", "200", "hello there");
        msg.attachments = vec![
            LocalAttachment {
                url: "https://cdn.test/a.png".to_string(),
                filename: "a.png".to_string(),
            },
            LocalAttachment {
                url: "https://cdn.test/broken.png".to_string(),
                filename: "broken.png".to_string(),
            },
        ];
        let outcome = h.router.dispatch(local_event(msg)).await;
        assert!(matches!(outcome, RelayOutcome::Delivered));

        let sent = h.external.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "T1");
        assert_eq!(sent[0].1.body, "hello there\n\nbob#0001");
        assert_eq!(sent[0].1.attachments.len(), 1);
        assert_eq!(sent[0].1.attachments[0].filename, "a.png");
    }

    #[tokio::test]
    async fn test_local_messages_filtered_before_lookup() {
        let h = harness();
        bound(&h, "T1", "C1", true);

        let mut own = local_message("C1", "bridge-bot", "echo");
        own.is_bridge_author = true;
        assert!(matches!(
            h.router.dispatch(local_event(own)).await,
            RelayOutcome::Ignored(IgnoreReason::BridgeAuthor)
        ));

        let mut foreign = local_message("C1", "200", "hi");
        foreign.guild_id = Some("other".to_string());
        assert!(matches!(
            h.router.dispatch(local_event(foreign)).await,
            RelayOutcome::Ignored(IgnoreReason::ForeignGuild)
        ));

        assert!(matches!(
            h.router.dispatch(local_event(local_message("C404", "200", "hi"))).await,
            RelayOutcome::Ignored(IgnoreReason::Unbound)
        ));
        assert!(h.external.sent().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_send_failure_is_reported() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        h.external.fail_send();
        let outcome = h.router.dispatch(local_event(local_message("C1", "200", "hi"))).await;
        assert!(matches!(outcome, RelayOutcome::Failed(BridgeError::Transient { .. })));
        assert_eq!(h.store.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_deleted_event_removes_binding() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        let outcome = h
            .router
            .dispatch(BridgeEvent::Local(LocalEvent::ChannelDeleted {
                channel_id: "C1".to_string(),
            }))
            .await;
        assert!(matches!(outcome, RelayOutcome::Cleaned));
        assert_eq!(h.store.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_image_attachment_becomes_embed() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        let event = BridgeEvent::External(ExternalEvent::Message(ExternalMessage {
            thread_id: "T1".to_string(),
            sender_id: "100".to_string(),
            sender_name: None,
            body: String::new(),
            attachments: vec![ExternalAttachment {
                kind: AttachmentKind::Photo,
                url: Some("https://cdn.test/p.jpg".to_string()),
                filename: None,
                content_type: None,
            }],
        }));
        assert!(matches!(h.router.dispatch(event).await, RelayOutcome::Delivered));
        let sent = h.local.sent();
        let payload = &sent[0].1;
        assert_eq!(payload.embeds.len(), 1);
        assert_eq!(payload.embeds[0].image_url.as_deref(), Some("https://cdn.test/p.jpg"));
    }

    fn with_files(thread: &str, body: &str, urls: &[&str]) -> BridgeEvent {
        BridgeEvent::External(ExternalEvent::Message(ExternalMessage {
            thread_id: thread.to_string(),
            sender_id: "100".to_string(),
            sender_name: Some("Alice".to_string()),
            body: body.to_string(),
            attachments: urls
                .iter()
                .map(|url| ExternalAttachment {
                    kind: AttachmentKind::Video,
                    url: Some(url.to_string()),
                    filename: None,
                    content_type: None,
                })
                .collect(),
        }))
    }

    #[tokio::test]
    async fn test_files_fetched_before_send() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        let event = with_files("T1", "clips", &["https://cdn.test/a.mp4", "https://cdn.test/b.mp4"]);
        assert!(matches!(h.router.dispatch(event).await, RelayOutcome::Delivered));

        let sent = h.local.sent();
        let payload = &sent[0].1;
        assert!(payload.files.is_empty());
        let names: Vec<&str> = payload.uploads.iter().map(|u| u.filename.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4"]);
        assert_eq!(payload.content, "clips");
    }

    #[tokio::test]
    async fn test_slow_file_does_not_fail_delivery() {
        let h = harness_with(
            settings().with_network_timeout(Duration::from_millis(100)),
            MockLocal::new(),
            MockExternal::new(),
        );
        bound(&h, "T1", "C1", true);
        let event = with_files("T1", "", &["https://cdn.test/slow.mp4", "https://cdn.test/ok.mp4"]);

        let outcome = h.router.dispatch(event).await;
        assert!(matches!(outcome, RelayOutcome::Delivered), "got {:?}", outcome);
        let sent = h.local.sent();
        let payload = &sent[0].1;
        assert_eq!(payload.uploads.len(), 1);
        assert_eq!(payload.uploads[0].filename, "ok.mp4");
        assert_eq!(payload.content, "[attachment slow.mp4 could not be relayed]");
    }

    #[tokio::test]
    async fn test_failed_only_file_still_sends_notice() {
        let h = harness();
        bound(&h, "T1", "C1", true);
        let event = with_files("T1", "", &["https://cdn.test/broken.mp4"]);

        assert!(matches!(h.router.dispatch(event).await, RelayOutcome::Delivered));
        let sent = h.local.sent();
        let payload = &sent[0].1;
        assert!(payload.uploads.is_empty());
        assert_eq!(payload.content, "[attachment broken.mp4 could not be relayed]");
    }

    #[tokio::test]
    async fn test_housekeeping_prunes_idle_locks() {
        let h = harness();
        h.router.dispatch(ext_message("T1", "100", "a")).await;
        h.router.dispatch(ext_message("T2", "100", "b")).await;
        assert_eq!(h.router.housekeeping(), 2);
        assert_eq!(h.router.housekeeping(), 0);
    }
}
