//! Inbound event bus feeding the router from both networks

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use threadlink_core::types::BridgeEvent;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Which network an event source listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Discord,
    Messenger,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discord => write!(f, "discord"),
            Self::Messenger => write!(f, "messenger"),
        }
    }
}

/// Trait that all network listeners implement
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Start listening, forwarding events to `tx`.
    /// Implementations spawn their own task and return once connected.
    async fn start(&self, tx: mpsc::Sender<BridgeEvent>) -> Result<()>;

    fn kind(&self) -> SourceKind;
}

/// Fan-in of every registered source into one receiver
pub struct EventBus {
    sources: HashMap<SourceKind, Arc<dyn EventSource>>,
    tx: mpsc::Sender<BridgeEvent>,
    rx: mpsc::Receiver<BridgeEvent>,
}

impl EventBus {
    /// Create a new bus with the specified buffer size for inbound events
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        info!("Created event bus with buffer size {}", buffer_size);
        Self {
            sources: HashMap::new(),
            tx,
            rx,
        }
    }

    pub fn register(&mut self, source: Arc<dyn EventSource>) {
        let kind = source.kind();
        info!("Registering event source: {}", kind);
        self.sources.insert(kind, source);
    }

    /// Start all registered sources. Fails on the first source that
    /// cannot start.
    pub async fn start_all(&self) -> Result<()> {
        info!("Starting all {} registered event sources", self.sources.len());

        for (kind, source) in &self.sources {
            debug!("Starting event source: {}", kind);
            if let Err(e) = source.start(self.tx.clone()).await {
                error!("Failed to start event source {}: {}", kind, e);
                return Err(anyhow!("Failed to start event source {}: {}", kind, e));
            }
            info!("Successfully started event source: {}", kind);
        }

        Ok(())
    }

    /// Next event from any source; None once every sender is gone
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    /// Extra sender for in-process producers
    pub fn sender(&self) -> mpsc::Sender<BridgeEvent> {
        self.tx.clone()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn has_source(&self, kind: SourceKind) -> bool {
        self.sources.contains_key(&kind)
    }

    /// Give up the bus, keeping only its receiver for a select! loop.
    /// The bus's own sender is dropped so the receiver closes once every
    /// source has stopped.
    pub fn into_receiver(self) -> mpsc::Receiver<BridgeEvent> {
        self.rx
    }
}
