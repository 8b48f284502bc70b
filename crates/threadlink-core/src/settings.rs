//! Runtime settings injected into the bridge core

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// What happens to the message that triggered provisioning of a new channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirstMessagePolicy {
    /// Only create the channel; later messages are relayed
    #[default]
    Defer,
    /// Create the channel, then relay the triggering message too
    Deliver,
}

/// Read-mostly configuration of the bridge core.
///
/// The global relay flag is the only field that changes at runtime.
#[derive(Debug)]
pub struct BridgeSettings {
    /// Display name of the bridge (nickname, webhook name)
    pub bridge_name: String,
    /// Member granted access to every provisioned channel
    pub admin_id: String,
    /// Server that owns the bridged channels
    pub guild_id: String,
    /// Parent category of bridged channels, matched case-insensitively
    pub category_name: String,
    pub first_message: FirstMessagePolicy,
    /// `allow` flag of freshly provisioned bindings
    pub default_allow: bool,
    /// Upper bound for any single network call made by the core
    pub network_timeout: Duration,
    /// Channel name prefix when no thread name can be resolved
    pub fallback_name_prefix: String,
    global_relay: AtomicBool,
}

impl BridgeSettings {
    pub fn new(
        bridge_name: impl Into<String>,
        admin_id: impl Into<String>,
        guild_id: impl Into<String>,
    ) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            admin_id: admin_id.into(),
            guild_id: guild_id.into(),
            category_name: "facebook".to_string(),
            first_message: FirstMessagePolicy::Defer,
            default_allow: true,
            network_timeout: Duration::from_secs(30),
            fallback_name_prefix: "User ".to_string(),
            global_relay: AtomicBool::new(false),
        }
    }

    pub fn with_category(mut self, name: impl Into<String>) -> Self {
        self.category_name = name.into();
        self
    }

    pub fn with_first_message(mut self, policy: FirstMessagePolicy) -> Self {
        self.first_message = policy;
        self
    }

    pub fn with_default_allow(mut self, allow: bool) -> Self {
        self.default_allow = allow;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_fallback_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.fallback_name_prefix = prefix.into();
        self
    }

    pub fn with_global_relay(self, enabled: bool) -> Self {
        self.global_relay.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn global_relay(&self) -> bool {
        self.global_relay.load(Ordering::SeqCst)
    }

    /// Flip the global relay flag. Returns the previous value.
    pub fn set_global_relay(&self, enabled: bool) -> bool {
        self.global_relay.swap(enabled, Ordering::SeqCst)
    }

    /// Channel name used when neither cache nor network knows the thread
    pub fn fallback_name(&self, thread_id: &str) -> String {
        format!("{}{}", self.fallback_name_prefix, thread_id)
    }
}
