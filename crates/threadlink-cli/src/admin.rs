//! Binding administration behind the `allow`, `block` and `bindings` subcommands

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use std::fmt;
use threadlink_core::{BindingKey, MappingStore, RoutingFlags};

/// One edit of a binding's routing flags.
///
/// User ids from both networks share one allow list and one deny list per
/// binding. Once the allow list is non-empty, only listed ids are relayed in
/// either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagChange {
    /// Relay the whole channel
    Allow,
    /// Stop relaying the channel
    Block,
    /// Add a Messenger sender id or Discord author id to the allow list
    AllowUser(String),
    /// Add a Messenger sender id or Discord author id to the deny list
    BlockUser(String),
}

impl FlagChange {
    pub fn new(allow: bool, user: Option<String>) -> Self {
        match (allow, user) {
            (true, None) => Self::Allow,
            (false, None) => Self::Block,
            (true, Some(user)) => Self::AllowUser(user),
            (false, Some(user)) => Self::BlockUser(user),
        }
    }

    pub fn apply(&self, flags: &mut RoutingFlags) {
        match self {
            Self::Allow => flags.allow = true,
            Self::Block => flags.allow = false,
            Self::AllowUser(user) => {
                flags.deny_list.remove(user);
                flags.allow_list.insert(user.clone());
            }
            Self::BlockUser(user) => {
                flags.allow_list.remove(user);
                flags.deny_list.insert(user.clone());
            }
        }
    }
}

impl fmt::Display for FlagChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allowed"),
            Self::Block => write!(f, "blocked"),
            Self::AllowUser(user) => write!(f, "allowed user {}", user),
            Self::BlockUser(user) => write!(f, "blocked user {}", user),
        }
    }
}

/// Apply `change` to the binding of a local channel and persist it
pub async fn change_flags(
    store: &dyn MappingStore,
    channel_id: &str,
    change: &FlagChange,
) -> Result<RoutingFlags> {
    let key = BindingKey::channel(channel_id);
    let binding = store
        .get_binding(&key)
        .await?
        .ok_or_else(|| anyhow!("No bridged thread is bound to channel {}", channel_id))?;

    let mut flags = binding.routing_flags;
    change.apply(&mut flags);
    if !store.update_flags(&key, &flags).await? {
        bail!("Binding for channel {} disappeared while updating", channel_id);
    }
    Ok(flags)
}

/// Reminder shown once a binding's allow list restricts relaying
pub fn allow_list_notice(flags: &RoutingFlags) -> Option<String> {
    if flags.allow_list.is_empty() {
        return None;
    }
    Some(format!(
        "Only {} may relay through this channel, in both directions. \
         Add the other side's ids with `allow --user` as well.",
        join(&flags.allow_list)
    ))
}

/// A binding joined with its cached thread name
#[derive(Debug, Clone)]
pub struct BindingRow {
    pub thread_id: String,
    pub channel_id: String,
    pub thread_name: Option<String>,
    pub flags: RoutingFlags,
    pub has_endpoint: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn binding_rows(store: &dyn MappingStore) -> Result<Vec<BindingRow>> {
    let mut rows = Vec::new();
    for binding in store.list_bindings().await? {
        let thread_name = store.get_thread_name(&binding.external_thread_id).await?;
        rows.push(BindingRow {
            thread_name,
            has_endpoint: binding.delivery_endpoint.is_some(),
            created_at: binding.created_at,
            flags: binding.routing_flags,
            thread_id: binding.external_thread_id,
            channel_id: binding.local_channel_id,
        });
    }
    Ok(rows)
}

/// Short human summary, e.g. `allow, 1 denied`
pub fn describe_flags(flags: &RoutingFlags) -> String {
    let mut parts = vec![if flags.allow { "allow" } else { "block" }.to_string()];
    if !flags.allow_list.is_empty() {
        parts.push(format!("only {}", join(&flags.allow_list)));
    }
    if !flags.deny_list.is_empty() {
        parts.push(format!("deny {}", join(&flags.deny_list)));
    }
    parts.join(", ")
}

fn join<'a>(ids: impl IntoIterator<Item = &'a String>) -> String {
    ids.into_iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

pub fn render_table(rows: &[BindingRow]) -> String {
    if rows.is_empty() {
        return "No bindings yet.".to_string();
    }
    let mut out = format!(
        "{:<20} {:<20} {:<24} {:<8} {}\n",
        "THREAD", "CHANNEL", "NAME", "WEBHOOK", "FLAGS"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<20} {:<20} {:<24} {:<8} {}\n",
            row.thread_id,
            row.channel_id,
            row.thread_name.as_deref().unwrap_or("-"),
            if row.has_endpoint { "yes" } else { "no" },
            describe_flags(&row.flags)
        ));
    }
    out
}
