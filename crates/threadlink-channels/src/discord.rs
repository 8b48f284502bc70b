//! Discord adapter using Serenity
//!
//! Implements the core `LocalServer` over Discord's REST API and feeds
//! gateway events (`message`, `channel_delete`) into the event bus.

use crate::bus::{EventSource, SourceKind};
use anyhow::{Context as _, anyhow};
use lru::LruCache;
use serde::Deserialize;
use serenity::builder::{
    CreateAttachment, CreateChannel, CreateEmbed, CreateEmbedFooter, CreateMessage, CreateWebhook,
    EditChannel, ExecuteWebhook,
};
use serenity::gateway::ActivityData;
use serenity::http::Http;
use serenity::{
    async_trait, gateway::GatewayError, model::gateway::Ready, model::prelude::*, prelude::*,
};
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use threadlink_core::error::{BridgeError, Result};
use threadlink_core::network::LocalServer;
use threadlink_core::types::{
    BridgeEvent, ChannelAccess, ContainerInfo, DeliveryTarget, EmbedSpec, FetchedAttachment,
    LocalAttachment, LocalEvent, LocalMessage, LocalPayload,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Discord's maximum message length in characters
const DISCORD_MAX_LENGTH: usize = 2000;
const MAX_CACHED_WEBHOOKS: usize = 256;

/// Activity shown next to the bot's name
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    #[default]
    Playing,
    Listening,
    Watching,
    Competing,
}

/// Bot presence applied once the gateway is ready
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Presence {
    #[serde(default)]
    pub kind: ActivityKind,
    pub text: String,
    /// online, idle, dnd or invisible
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "online".to_string()
}

impl Presence {
    fn activity(&self) -> ActivityData {
        match self.kind {
            ActivityKind::Playing => ActivityData::playing(&self.text),
            ActivityKind::Listening => ActivityData::listening(&self.text),
            ActivityKind::Watching => ActivityData::watching(&self.text),
            ActivityKind::Competing => ActivityData::competing(&self.text),
        }
    }

    fn online_status(&self) -> OnlineStatus {
        match self.status.to_lowercase().as_str() {
            "idle" => OnlineStatus::Idle,
            "dnd" => OnlineStatus::DoNotDisturb,
            "invisible" => OnlineStatus::Invisible,
            _ => OnlineStatus::Online,
        }
    }
}

/// Type key for storing the inbound event sender in Serenity's TypeMap
struct EventSender;

impl TypeMapKey for EventSender {
    type Value = mpsc::Sender<BridgeEvent>;
}

/// Type key for the bridge's own user id
struct BridgeUser;

impl TypeMapKey for BridgeUser {
    type Value = Arc<OnceLock<UserId>>;
}

/// Event handler for Discord gateway events
struct DiscordHandler {
    presence: Option<Presence>,
}

impl DiscordHandler {
    async fn forward(ctx: &Context, event: BridgeEvent) {
        let tx = {
            let data = ctx.data.read().await;
            match data.get::<EventSender>() {
                Some(tx) => tx.clone(),
                None => {
                    error!("EventSender not initialized in TypeMap");
                    return;
                }
            }
        };
        if let Err(e) = tx.send(event).await {
            error!("Failed to send Discord event to bus: {}", e);
        }
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        let bridge_user = {
            let data = ctx.data.read().await;
            data.get::<BridgeUser>().and_then(|u| u.get().copied())
        };
        let is_bridge_author =
            msg.author.bot || msg.webhook_id.is_some() || Some(msg.author.id) == bridge_user;

        debug!(
            "Received message in channel {} from {} ({})",
            msg.channel_id, msg.author.name, msg.author.id
        );

        let local = LocalMessage {
            channel_id: msg.channel_id.to_string(),
            guild_id: msg.guild_id.map(|g| g.to_string()),
            author_id: msg.author.id.to_string(),
            author_tag: msg.author.tag(),
            is_bridge_author,
            body: msg.content.clone(),
            attachments: msg
                .attachments
                .iter()
                .map(|a| LocalAttachment {
                    url: a.url.clone(),
                    filename: a.filename.clone(),
                })
                .collect(),
        };
        Self::forward(&ctx, BridgeEvent::Local(LocalEvent::Message(local))).await;
    }

    async fn channel_delete(&self, ctx: Context, channel: GuildChannel, _messages: Option<Vec<Message>>) {
        debug!("Channel {} deleted", channel.id);
        Self::forward(
            &ctx,
            BridgeEvent::Local(LocalEvent::ChannelDeleted {
                channel_id: channel.id.to_string(),
            }),
        )
        .await;
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
        {
            let data = ctx.data.read().await;
            if let Some(user) = data.get::<BridgeUser>() {
                let _ = user.set(ready.user.id);
            }
        }
        if let Some(presence) = &self.presence {
            ctx.set_presence(Some(presence.activity()), presence.online_status());
            debug!("Presence set to {:?} '{}'", presence.kind, presence.text);
        }
    }
}

/// Discord side of the bridge
pub struct DiscordServer {
    token: String,
    guild_id: GuildId,
    presence: Option<Presence>,
    http: Arc<Http>,
    bridge_user: Arc<OnceLock<UserId>>,
    webhooks: Mutex<LruCache<String, Webhook>>,
    cancel: CancellationToken,
}

impl DiscordServer {
    /// Create a new Discord adapter
    ///
    /// # Arguments
    /// * `token` - Discord bot token
    /// * `guild_id` - Server hosting the bridged channels
    pub fn new(token: String, guild_id: &str) -> anyhow::Result<Self> {
        let guild_id = GuildId::new(
            parse_snowflake(guild_id).with_context(|| format!("Invalid Discord guild id '{}'", guild_id))?,
        );
        Ok(Self {
            http: Arc::new(Http::new(&token)),
            token,
            guild_id,
            presence: None,
            bridge_user: Arc::new(OnceLock::new()),
            webhooks: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_WEBHOOKS).unwrap_or(NonZeroUsize::MIN),
            )),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_presence(mut self, presence: Option<Presence>) -> Self {
        self.presence = presence;
        self
    }

    /// Cancelled when the gateway fails for good
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn http(&self) -> &Http {
        &self.http
    }

    /// Check the token over REST and learn the bridge's own user id
    pub async fn verify(&self) -> anyhow::Result<String> {
        let me = self.http.get_current_user().await.map_err(|e| {
            if http_status(&e) == Some(401) {
                anyhow!("Discord rejected the bot token (401 Unauthorized)")
            } else {
                anyhow!("Failed to reach Discord: {}", e)
            }
        })?;
        let _ = self.bridge_user.set(me.id);
        Ok(me.tag())
    }

    async fn webhook(&self, url: &str) -> Result<Webhook> {
        if let Some(hook) = self.webhooks.lock().await.get(url) {
            return Ok(hook.clone());
        }
        let hook = Webhook::from_url(self.http(), url)
            .await
            .map_err(|e| map_error("load webhook", e))?;
        self.webhooks.lock().await.put(url.to_string(), hook.clone());
        Ok(hook)
    }

    async fn send_via_webhook(
        &self,
        url: &str,
        payload: &LocalPayload,
        chunks: Vec<String>,
        mut embeds: Vec<CreateEmbed>,
        mut files: Vec<CreateAttachment>,
    ) -> Result<()> {
        let webhook = self.webhook(url).await?;
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut builder = ExecuteWebhook::new().content(chunk);
            if let Some(name) = &payload.username {
                builder = builder.username(name);
            }
            if let Some(avatar) = &payload.avatar_url {
                builder = builder.avatar_url(avatar);
            }
            if i == last {
                builder = builder
                    .embeds(std::mem::take(&mut embeds))
                    .add_files(std::mem::take(&mut files));
            }
            if let Err(e) = webhook.execute(self.http(), false, builder).await {
                if http_status(&e) == Some(404) {
                    self.webhooks.lock().await.pop(url);
                }
                return Err(map_error("execute webhook", e));
            }
        }
        Ok(())
    }

    async fn send_as_bot(
        &self,
        channel_id: ChannelId,
        chunks: Vec<String>,
        mut embeds: Vec<CreateEmbed>,
        mut files: Vec<CreateAttachment>,
    ) -> Result<()> {
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut builder = CreateMessage::new().content(chunk);
            if i == last {
                builder = builder
                    .embeds(std::mem::take(&mut embeds))
                    .add_files(std::mem::take(&mut files));
            }
            channel_id
                .send_message(self.http(), builder)
                .await
                .map_err(|e| map_error("send message", e))?;

            // Small delay between chunks to ensure proper ordering
            if i < last {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(())
    }
}

/// Check if a serenity error represents a fatal gateway condition that should not be retried
fn is_fatal_gateway_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(gateway_err) => matches!(
            gateway_err,
            GatewayError::InvalidAuthentication
                | GatewayError::NoAuthentication
                | GatewayError::InvalidShardData
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
        ),
        _ => false,
    }
}

fn http_status(err: &serenity::Error) -> Option<u16> {
    match err {
        serenity::Error::Http(http_err) => http_err.status_code().map(|s| s.as_u16()),
        _ => None,
    }
}

/// Map a REST failure onto the bridge taxonomy: 404 is `NotFound`,
/// everything else is transient.
fn map_error(operation: &str, err: serenity::Error) -> BridgeError {
    if http_status(&err) == Some(404) {
        BridgeError::not_found(format!("{} target ({})", operation, err))
    } else {
        BridgeError::transient(operation, err)
    }
}

fn parse_snowflake(raw: &str) -> anyhow::Result<u64> {
    let id: NonZeroU64 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow!("'{}' is not a Discord id: {}", raw, e))?;
    Ok(id.get())
}

fn channel_id(raw: &str) -> Result<ChannelId> {
    parse_snowflake(raw)
        .map(ChannelId::new)
        .map_err(BridgeError::configuration)
}

fn user_id(raw: &str) -> Result<UserId> {
    parse_snowflake(raw).map(UserId::new).map_err(BridgeError::configuration)
}

/// Permission overwrites of a bridged channel: hidden from everyone but
/// the admin and the bridge itself.
fn channel_overwrites(access: &ChannelAccess) -> Result<Vec<PermissionOverwrite>> {
    let mut overwrites = vec![
        PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Member(user_id(&access.admin_id)?),
        },
        PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL,
            kind: PermissionOverwriteType::Role(RoleId::new(
                parse_snowflake(&access.default_role_id).map_err(BridgeError::configuration)?,
            )),
        },
    ];
    if !access.bridge_id.is_empty() {
        overwrites.push(PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES | Permissions::MANAGE_CHANNELS,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Member(user_id(&access.bridge_id)?),
        });
    }
    Ok(overwrites)
}

fn to_attachments(uploads: Vec<FetchedAttachment>) -> Vec<CreateAttachment> {
    uploads
        .into_iter()
        .map(|file| CreateAttachment::bytes(file.data, file.filename))
        .collect()
}

fn to_embed(spec: &EmbedSpec) -> CreateEmbed {
    let mut embed = CreateEmbed::new();
    if let Some(url) = &spec.image_url {
        embed = embed.image(url);
    }
    if let Some(text) = &spec.footer {
        embed = embed.footer(CreateEmbedFooter::new(text));
    }
    embed
}

/// Split a message into chunks that fit Discord's 2000 character limit.
/// Tries to split at newlines to avoid breaking in the middle of sentences.
fn split_message(content: &str) -> Vec<String> {
    if content.len() <= DISCORD_MAX_LENGTH {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current_chunk = String::new();

    for line in content.lines() {
        // If a single line is longer than the limit, split it by words
        if line.len() > DISCORD_MAX_LENGTH {
            if !current_chunk.is_empty() {
                chunks.push(std::mem::take(&mut current_chunk));
            }

            for word in line.split_whitespace() {
                for piece in split_long_word(word) {
                    if current_chunk.len() + piece.len() + 1 > DISCORD_MAX_LENGTH
                        && !current_chunk.is_empty()
                    {
                        chunks.push(std::mem::take(&mut current_chunk));
                    }
                    if !current_chunk.is_empty() {
                        current_chunk.push(' ');
                    }
                    current_chunk.push_str(piece);
                }
            }
            continue;
        }

        let line_with_newline = if current_chunk.is_empty() {
            line.to_string()
        } else {
            format!("\n{}", line)
        };

        if current_chunk.len() + line_with_newline.len() > DISCORD_MAX_LENGTH {
            chunks.push(std::mem::take(&mut current_chunk));
            current_chunk = line.to_string();
        } else {
            current_chunk.push_str(&line_with_newline);
        }
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    chunks
}

/// Hard-split a single word longer than the limit on char boundaries
fn split_long_word(word: &str) -> Vec<&str> {
    if word.len() <= DISCORD_MAX_LENGTH {
        return vec![word];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < word.len() {
        let mut end = (start + DISCORD_MAX_LENGTH).min(word.len());
        while !word.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(&word[start..end]);
        start = end;
    }
    pieces
}

#[async_trait]
impl EventSource for DiscordServer {
    async fn start(&self, tx: mpsc::Sender<BridgeEvent>) -> anyhow::Result<()> {
        info!("Starting Discord adapter");

        let tag = self.verify().await?;
        info!("Discord token valid, bridge user is {}", tag);

        let token = self.token.clone();
        let bridge_user = self.bridge_user.clone();
        let presence = self.presence.clone();
        let cancel = self.cancel.clone();

        // Spawn the Discord client in a background task with retry logic
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(60);
            let mut retry_count = 0;

            loop {
                retry_count += 1;
                info!("Discord client starting (attempt #{})", retry_count);

                let intents = GatewayIntents::GUILDS
                    | GatewayIntents::GUILD_MESSAGES
                    | GatewayIntents::MESSAGE_CONTENT;

                let mut client = match Client::builder(&token, intents)
                    .event_handler(DiscordHandler {
                        presence: presence.clone(),
                    })
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord fatal error (will not retry): {}", e);
                            cancel.cancel();
                            break;
                        }
                        error!("Failed to create Discord client: {}", e);
                        warn!("Retrying in {:?}...", backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                        continue;
                    }
                };

                {
                    let mut data = client.data.write().await;
                    data.insert::<EventSender>(tx.clone());
                    data.insert::<BridgeUser>(bridge_user.clone());
                }

                let shard_manager = client.shard_manager.clone();
                let result = tokio::select! {
                    result = client.start() => result,
                    _ = cancel.cancelled() => {
                        shard_manager.shutdown_all().await;
                        break;
                    }
                };

                match result {
                    Ok(_) => {
                        info!("Discord client stopped cleanly");
                        break;
                    }
                    Err(e) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord fatal error (will not retry): {}", e);
                            error!(
                                "Check the bot token and enable the MESSAGE CONTENT intent at https://discord.com/developers/applications"
                            );
                            cancel.cancel();
                            break;
                        }
                        error!("Discord client error: {}", e);
                        warn!("Retrying in {:?}...", backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }
            }

            info!("Discord client task exiting");
        });

        info!("Discord adapter started");
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Discord
    }
}

#[async_trait]
impl LocalServer for DiscordServer {
    fn bridge_user_id(&self) -> String {
        self.bridge_user
            .get()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let channels = self
            .guild_id
            .channels(self.http())
            .await
            .map_err(|e| map_error("list channels", e))?;
        Ok(channels
            .into_values()
            .filter(|c| c.kind == ChannelType::Category)
            .map(|c| ContainerInfo {
                id: c.id.to_string(),
                name: c.name,
            })
            .collect())
    }

    async fn create_channel(&self, parent_id: &str, name: &str, access: &ChannelAccess) -> Result<String> {
        let builder = CreateChannel::new(name)
            .kind(ChannelType::Text)
            .category(channel_id(parent_id)?)
            .permissions(channel_overwrites(access)?);
        let channel = self
            .guild_id
            .create_channel(self.http(), builder)
            .await
            .map_err(|e| map_error("create channel", e))?;
        Ok(channel.id.to_string())
    }

    async fn create_named_endpoint(&self, channel: &str, name: &str) -> Result<Option<String>> {
        let hook = channel_id(channel)?
            .create_webhook(self.http(), CreateWebhook::new(name))
            .await
            .map_err(|e| map_error("create webhook", e))?;
        let url = hook
            .url()
            .map_err(|e| BridgeError::transient("create webhook", e))?;
        self.webhooks.lock().await.put(url.clone(), hook);
        Ok(Some(url))
    }

    async fn fetch_channel(&self, channel: &str) -> Result<()> {
        self.http
            .get_channel(channel_id(channel)?)
            .await
            .map(|_| ())
            .map_err(|e| map_error("fetch channel", e))
    }

    async fn rename_channel(&self, channel: &str, name: &str) -> Result<()> {
        channel_id(channel)?
            .edit(self.http(), EditChannel::new().name(name))
            .await
            .map(|_| ())
            .map_err(|e| map_error("rename channel", e))
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        channel_id(channel)?
            .delete(self.http())
            .await
            .map(|_| ())
            .map_err(|e| map_error("delete channel", e))
    }

    // TODO: recreate the webhook when the endpoint comes back 404 but the
    // channel still exists; today those deliveries fail until re-provisioned.
    async fn send(&self, target: &DeliveryTarget, mut payload: LocalPayload) -> Result<()> {
        if !payload.files.is_empty() {
            warn!("Ignoring {} unfetched file(s) in payload", payload.files.len());
        }
        let files = to_attachments(std::mem::take(&mut payload.uploads));
        let embeds: Vec<CreateEmbed> = payload.embeds.iter().map(to_embed).collect();
        let chunks = split_message(&payload.content);

        if chunks.len() > 1 {
            debug!(
                "Message split into {} chunks due to Discord's character limit",
                chunks.len()
            );
        }

        match target {
            DeliveryTarget::Endpoint(url) => {
                self.send_via_webhook(url, &payload, chunks, embeds, files).await
            }
            DeliveryTarget::Channel(id) => self.send_as_bot(channel_id(id)?, chunks, embeds, files).await,
        }
    }
}
