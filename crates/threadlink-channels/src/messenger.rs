//! Messenger adapter talking to a session gateway over HTTP
//!
//! The gateway is a separate process holding the logged-in Messenger
//! session. Inbound events are polled from `/events`; outbound calls map
//! one-to-one onto gateway endpoints.

use crate::bus::{EventSource, SourceKind};
use crate::health::SessionHealth;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use threadlink_core::error::{BridgeError, Result};
use threadlink_core::network::ExternalNetwork;
use threadlink_core::types::{
    AttachmentKind, BridgeEvent, ConversationInfo, ExternalAttachment, ExternalEvent,
    ExternalMessage, ExternalPayload,
};
use tokio::sync::{RwLock, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Consecutive poll failures between repeated warnings
const POLL_WARN_EVERY: u32 = 60;

/// One page of `/events`
#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Message(WireMessage),
    Event(WireLogEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "threadID")]
    thread_id: String,
    #[serde(rename = "senderID")]
    sender_id: String,
    #[serde(rename = "senderName", default)]
    sender_name: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(rename = "mimeType", alias = "contentType", default)]
    mime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireLogEvent {
    #[serde(rename = "threadID")]
    thread_id: String,
    #[serde(rename = "logMessageType")]
    log_type: String,
    #[serde(rename = "logMessageData", default)]
    data: Value,
}

/// Messenger session gateway client
#[derive(Clone)]
pub struct MessengerClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    app_state: Option<String>,
    poll_interval: Duration,
    user_id: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
}

impl MessengerClient {
    /// Create a new gateway client
    ///
    /// # Arguments
    /// * `base_url` - Root URL of the session gateway
    /// * `token` - Bearer token the gateway expects
    /// * `app_state` - Serialized Messenger login state, used for (re)login
    /// * `poll_interval` - How often `/events` is polled
    /// * `timeout` - Per-request timeout
    pub fn new(
        base_url: &str,
        token: String,
        app_state: Option<String>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid Messenger gateway URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("Messenger gateway URL '{}' cannot hold paths", base_url));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for Messenger")?;

        Ok(Self {
            client,
            base_url,
            token,
            app_state: app_state.filter(|s| !s.trim().is_empty()),
            poll_interval,
            user_id: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop polling when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Messenger user id of the bridge account, once logged in
    pub async fn user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Send a request and decode its JSON body, mapping gateway failures
    async fn api_call(&self, operation: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BridgeError::transient(operation, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::not_found(format!("{} target", operation)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::transient(
                operation,
                format!("gateway HTTP {}: {}", status, detail.trim()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BridgeError::transient(operation, format!("bad gateway response: {}", e)))?;

        if body.get("ok").and_then(|v| v.as_bool()) == Some(false) {
            let err = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            return Err(BridgeError::transient(operation, format!("gateway error: {}", err)));
        }
        Ok(body)
    }

    /// Log in with the stored app state, returning the bridge's user id
    pub async fn login(&self) -> Result<String> {
        let app_state = self.app_state.as_deref().ok_or_else(|| {
            BridgeError::configuration("no Messenger app state configured, cannot log in")
        })?;
        let body = serde_json::json!({ "appState": app_state });
        let result = self
            .api_call("login", self.client.post(self.endpoint(&["login"])).json(&body))
            .await?;
        let user_id = user_id_of(&result)
            .ok_or_else(|| BridgeError::transient("login", "gateway returned no userID"))?;
        *self.user_id.write().await = Some(user_id.clone());
        Ok(user_id)
    }

    /// Check the session; returns the user id the gateway reports
    pub async fn health(&self) -> Result<String> {
        let result = self
            .api_call("health check", self.client.get(self.endpoint(&["health"])))
            .await?;
        if result.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            return Err(BridgeError::transient("health check", "session is not logged in"));
        }
        let user_id = user_id_of(&result)
            .ok_or_else(|| BridgeError::transient("health check", "gateway returned no userID"))?;
        *self.user_id.write().await = Some(user_id.clone());
        Ok(user_id)
    }

    /// Reuse a live session, logging in only when there is none
    async fn establish_session(&self) -> Result<String> {
        match self.health().await {
            Ok(user_id) => Ok(user_id),
            Err(e) if self.app_state.is_some() => {
                debug!("No live Messenger session ({}), logging in", e);
                self.login().await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_events(&self, cursor: Option<&str>) -> Result<EventsPage> {
        let mut request = self.client.get(self.endpoint(&["events"]));
        if let Some(cursor) = cursor {
            request = request.query(&[("after", cursor)]);
        }
        let body = self.api_call("poll events", request).await?;
        serde_json::from_value(body)
            .map_err(|e| BridgeError::transient("poll events", format!("malformed event page: {}", e)))
    }

    async fn poll_loop(self, tx: mpsc::Sender<BridgeEvent>, mut cursor: Option<String>) {
        info!("Messenger polling task started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = PollFailures::default();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let page = match self.fetch_events(cursor.as_deref()).await {
                Ok(page) => {
                    if let Some(count) = failures.recovered() {
                        info!("Messenger polling recovered after {} failed attempt(s)", count);
                    }
                    page
                }
                Err(e) => {
                    let count = failures.failed();
                    if PollFailures::should_warn(count) {
                        warn!("Messenger poll failed ({} in a row): {}", count, e);
                    } else {
                        debug!("Messenger poll failed ({} in a row): {}", count, e);
                    }
                    continue;
                }
            };
            if page.cursor.is_some() {
                cursor = page.cursor.clone();
            }

            let own_id = self.user_id().await.unwrap_or_default();
            for event in translate_page(page, &own_id) {
                debug!("Forwarding Messenger event for thread {}", event.thread_id());
                if let Err(e) = tx.send(BridgeEvent::External(event)).await {
                    error!("Failed to send Messenger event to bus: {}", e);
                    info!("Messenger polling task exiting");
                    return;
                }
            }
        }

        info!("Messenger polling task stopped");
    }
}

/// Run of consecutive failed polls. The first failure and every
/// `POLL_WARN_EVERY`th after it are logged at warn level.
#[derive(Debug, Default)]
struct PollFailures {
    consecutive: u32,
}

impl PollFailures {
    fn failed(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }

    /// Length of the run that just ended, if any
    fn recovered(&mut self) -> Option<u32> {
        (self.consecutive > 0).then(|| std::mem::take(&mut self.consecutive))
    }

    fn should_warn(count: u32) -> bool {
        count == 1 || count % POLL_WARN_EVERY == 0
    }
}

fn user_id_of(body: &Value) -> Option<String> {
    match body.get("userID")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn a gateway page into bridge events, dropping the bridge's own
/// messages and log events that do not concern it.
fn translate_page(page: EventsPage, own_id: &str) -> Vec<ExternalEvent> {
    page.events
        .into_iter()
        .filter_map(|event| match event {
            WireEvent::Message(msg) => {
                if !own_id.is_empty() && msg.sender_id == own_id {
                    return None;
                }
                Some(ExternalEvent::Message(ExternalMessage {
                    thread_id: msg.thread_id,
                    sender_id: msg.sender_id,
                    sender_name: msg.sender_name.filter(|n| !n.is_empty()),
                    body: msg.body,
                    attachments: msg
                        .attachments
                        .into_iter()
                        .map(|a| ExternalAttachment {
                            kind: AttachmentKind::from_wire(&a.kind),
                            url: a.url.filter(|u| !u.is_empty()),
                            filename: a.filename.filter(|f| !f.is_empty()),
                            content_type: a.mime.filter(|m| !m.is_empty()),
                        })
                        .collect(),
                }))
            }
            WireEvent::Event(log) => translate_log_event(log, own_id),
            WireEvent::Unknown => None,
        })
        .collect()
}

fn translate_log_event(log: WireLogEvent, own_id: &str) -> Option<ExternalEvent> {
    let thread_id = log.thread_id;
    match log.log_type.as_str() {
        "log:subscribe" => {
            let added = log.data.get("addedParticipants")?.as_array()?;
            added
                .iter()
                .any(|p| participant_id(p, "userFbId") == Some(own_id))
                .then_some(ExternalEvent::Subscribe { thread_id })
        }
        "log:unsubscribe" => {
            (participant_id(&log.data, "leftParticipantFbId") == Some(own_id))
                .then_some(ExternalEvent::Unsubscribe { thread_id })
        }
        "log:thread-name" => {
            let name = log.data.get("name")?.as_str()?.trim();
            (!name.is_empty()).then(|| ExternalEvent::Rename {
                thread_id,
                name: name.to_string(),
            })
        }
        other => {
            debug!("Ignoring Messenger log event {} in thread {}", other, thread_id);
            None
        }
    }
}

fn participant_id<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field)?.as_str()
}

#[async_trait]
impl EventSource for MessengerClient {
    async fn start(&self, tx: mpsc::Sender<BridgeEvent>) -> anyhow::Result<()> {
        info!("Starting Messenger session adapter");

        let user_id = self
            .establish_session()
            .await
            .context("Messenger session gateway refused the bridge")?;
        info!("Messenger session active as user {}", user_id);

        // The priming request only establishes the cursor; backlog from
        // before start-up is not replayed.
        let cursor = match self.fetch_events(None).await {
            Ok(page) => page.cursor,
            Err(e) => {
                warn!("Could not prime Messenger event cursor: {}", e);
                None
            }
        };

        tokio::spawn(self.clone().poll_loop(tx, cursor));
        info!("Messenger session adapter started");
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Messenger
    }
}

#[async_trait]
impl ExternalNetwork for MessengerClient {
    async fn send(&self, thread_id: &str, payload: ExternalPayload) -> Result<()> {
        let mut form = reqwest::multipart::Form::new().text("body", payload.body);
        for file in payload.attachments {
            let size = file.data.len();
            let part = reqwest::multipart::Part::bytes(file.data).file_name(file.filename.clone());
            let part = match file.content_type.as_deref() {
                Some(ct) => match part.mime_str(ct) {
                    Ok(typed) => typed,
                    Err(e) => {
                        warn!("Dropping attachment {} with bad content type: {}", file.filename, e);
                        continue;
                    }
                },
                None => part,
            };
            debug!("Attaching {} ({} bytes)", file.filename, size);
            form = form.part("attachment", part);
        }

        let url = self.endpoint(&["threads", thread_id, "messages"]);
        self.api_call("send message", self.client.post(url).multipart(form))
            .await?;
        debug!("Message sent to Messenger thread {}", thread_id);
        Ok(())
    }

    async fn conversation_info(&self, thread_id: &str) -> Result<ConversationInfo> {
        let body = self
            .api_call(
                "fetch thread info",
                self.client.get(self.endpoint(&["threads", thread_id])),
            )
            .await?;
        Ok(ConversationInfo {
            display_name: body
                .get("threadName")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        })
    }

    async fn set_own_nickname(&self, thread_id: &str, name: &str) -> Result<()> {
        let participant = self
            .user_id()
            .await
            .ok_or_else(|| BridgeError::transient("set nickname", "session not established"))?;
        let body = serde_json::json!({ "nickname": name, "participantID": participant });
        self.api_call(
            "set nickname",
            self.client
                .post(self.endpoint(&["threads", thread_id, "nickname"]))
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionHealth for MessengerClient {
    async fn probe(&self) -> Result<()> {
        self.health().await.map(|_| ())
    }

    async fn reconnect(&self) -> Result<()> {
        let user_id = self.login().await?;
        info!("Messenger session re-established as user {}", user_id);
        Ok(())
    }
}
