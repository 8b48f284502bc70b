//! Shared types for threadlink-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-binding routing flags.
///
/// Stored as JSON. A bare JSON boolean is accepted on read (legacy rows
/// from the legacy `allow` column) and means `{ allow: <bool> }`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoutingFlags {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allow_list: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_list: BTreeSet<String>,
}

impl RoutingFlags {
    pub fn allowing(allow: bool) -> Self {
        Self {
            allow,
            allow_list: BTreeSet::new(),
            deny_list: BTreeSet::new(),
        }
    }
}

impl Default for RoutingFlags {
    fn default() -> Self {
        Self::allowing(true)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFlags {
    Legacy(bool),
    Structured {
        allow: bool,
        #[serde(default)]
        allow_list: BTreeSet<String>,
        #[serde(default)]
        deny_list: BTreeSet<String>,
    },
}

impl<'de> Deserialize<'de> for RoutingFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match StoredFlags::deserialize(deserializer)? {
            StoredFlags::Legacy(allow) => Self::allowing(allow),
            StoredFlags::Structured {
                allow,
                allow_list,
                deny_list,
            } => Self {
                allow,
                allow_list,
                deny_list,
            },
        })
    }
}

/// Durable pairing between one external thread and one local channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadBinding {
    pub external_thread_id: String,
    pub local_channel_id: String,
    pub routing_flags: RoutingFlags,
    /// Webhook-style URL; present only when the local server can post
    /// under an arbitrary display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ThreadBinding {
    pub fn new(
        external_thread_id: impl Into<String>,
        local_channel_id: impl Into<String>,
        routing_flags: RoutingFlags,
        delivery_endpoint: Option<String>,
    ) -> Self {
        Self {
            external_thread_id: external_thread_id.into(),
            local_channel_id: local_channel_id.into(),
            routing_flags,
            delivery_endpoint,
            created_at: Utc::now(),
        }
    }

    /// Where relayed messages for this binding are posted
    pub fn delivery_target(&self) -> DeliveryTarget {
        match &self.delivery_endpoint {
            Some(url) => DeliveryTarget::Endpoint(url.clone()),
            None => DeliveryTarget::Channel(self.local_channel_id.clone()),
        }
    }
}

/// Lookup key for a binding; either side is unique
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingKey {
    Thread(String),
    Channel(String),
}

impl BindingKey {
    pub fn thread(id: impl Into<String>) -> Self {
        Self::Thread(id.into())
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::Channel(id.into())
    }
}

impl std::fmt::Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thread(id) => write!(f, "thread {}", id),
            Self::Channel(id) => write!(f, "channel {}", id),
        }
    }
}

/// Media kind of an external attachment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    AnimatedImage,
    Sticker,
    Audio,
    Video,
    File,
    Location,
    Share,
    Other,
}

impl AttachmentKind {
    /// Parse the wire name used by the external network
    pub fn from_wire(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "photo" => Self::Photo,
            "animated_image" => Self::AnimatedImage,
            "sticker" => Self::Sticker,
            "audio" => Self::Audio,
            "video" => Self::Video,
            "file" => Self::File,
            "location" => Self::Location,
            "share" => Self::Share,
            _ => Self::Other,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Photo | Self::AnimatedImage | Self::Sticker)
    }
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Photo => "photo",
            Self::AnimatedImage => "animated_image",
            Self::Sticker => "sticker",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::File => "file",
            Self::Location => "location",
            Self::Share => "share",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalAttachment {
    pub kind: AttachmentKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    /// MIME type reported by the network, if any
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Message observed on the external network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMessage {
    pub thread_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<ExternalAttachment>,
}

/// Events coming from the external network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExternalEvent {
    Message(ExternalMessage),
    /// The bridge was added to the conversation
    Subscribe { thread_id: String },
    /// The bridge was removed from (or left) the conversation
    Unsubscribe { thread_id: String },
    /// The conversation display name changed
    Rename { thread_id: String, name: String },
}

impl ExternalEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            Self::Message(msg) => &msg.thread_id,
            Self::Subscribe { thread_id }
            | Self::Unsubscribe { thread_id }
            | Self::Rename { thread_id, .. } => thread_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalAttachment {
    pub url: String,
    pub filename: String,
}

/// Message observed on the local chat server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalMessage {
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub author_id: String,
    /// Display tag of the author, appended to relayed bodies
    pub author_tag: String,
    /// True for the bridge's own posts (bot user or its webhooks)
    pub is_bridge_author: bool,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<LocalAttachment>,
}

/// Events coming from the local chat server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalEvent {
    Message(LocalMessage),
    ChannelDeleted { channel_id: String },
}

/// Anything the router dispatches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum BridgeEvent {
    External(ExternalEvent),
    Local(LocalEvent),
}

impl std::fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External(ExternalEvent::Message(m)) => write!(f, "external message in {}", m.thread_id),
            Self::External(ExternalEvent::Subscribe { thread_id }) => write!(f, "subscribe {}", thread_id),
            Self::External(ExternalEvent::Unsubscribe { thread_id }) => write!(f, "unsubscribe {}", thread_id),
            Self::External(ExternalEvent::Rename { thread_id, .. }) => write!(f, "rename {}", thread_id),
            Self::Local(LocalEvent::Message(m)) => write!(f, "local message in {}", m.channel_id),
            Self::Local(LocalEvent::ChannelDeleted { channel_id }) => write!(f, "channel {} deleted", channel_id),
        }
    }
}

/// Where a local payload is posted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// Named posting endpoint (webhook URL)
    Endpoint(String),
    /// Post as the bridge user into a channel
    Channel(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedSpec {
    pub image_url: Option<String>,
    pub footer: Option<String>,
}

/// File to re-upload from a remote URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub url: String,
    pub filename: String,
}

/// Outbound payload for the local chat server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPayload {
    pub content: String,
    /// Display name override (named endpoints only)
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub embeds: Vec<EmbedSpec>,
    /// Remote files still to be fetched
    pub files: Vec<FileUpload>,
    /// Fetched file bytes, posted with the last chunk
    pub uploads: Vec<FetchedAttachment>,
}

/// Bytes pulled from a remote URL for re-upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAttachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Local→external draft before attachment bytes are fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDraft {
    pub body: String,
    pub attachment_urls: Vec<LocalAttachment>,
}

/// Outbound payload for the external network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalPayload {
    pub body: String,
    pub attachments: Vec<FetchedAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationInfo {
    pub display_name: Option<String>,
}

/// Category-like grouping container on the local server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
}

/// Visibility granted to a freshly provisioned channel: the listed
/// members can see it, the server's default role cannot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAccess {
    pub bridge_id: String,
    pub admin_id: String,
    pub default_role_id: String,
}
