//! HTTP attachment fetcher used for re-uploading files across networks

use async_trait::async_trait;
use std::time::Duration;
use threadlink_core::error::{BridgeError, Result};
use threadlink_core::network::AttachmentFetcher;
use threadlink_core::types::FetchedAttachment;
use tracing::debug;

/// Largest attachment pulled into memory (25 MiB, the local server's upload cap)
pub const MAX_ATTACHMENT_BYTES: usize = 25 * 1024 * 1024;

pub struct HttpAttachmentFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpAttachmentFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_bytes: MAX_ATTACHMENT_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// Only plain web URLs may be fetched
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| BridgeError::transient("fetch attachment", format!("invalid url {}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(BridgeError::transient(
            "fetch attachment",
            format!("unsupported url scheme '{}'", other),
        )),
    }
}

#[async_trait]
impl AttachmentFetcher for HttpAttachmentFetcher {
    async fn fetch(&self, url: &str, filename: &str) -> Result<FetchedAttachment> {
        let url = validate_url(url)?;
        let op = "fetch attachment";

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| BridgeError::transient(op, e))?;

        if !response.status().is_success() {
            return Err(BridgeError::transient(
                op,
                format!("HTTP {} for {}", response.status(), url),
            ));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.max_bytes
        {
            return Err(BridgeError::transient(
                op,
                format!("{} is {} bytes, limit is {}", filename, len, self.max_bytes),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| BridgeError::transient(op, e))? {
            if data.len() + chunk.len() > self.max_bytes {
                return Err(BridgeError::transient(
                    op,
                    format!("{} exceeds {} bytes", filename, self.max_bytes),
                ));
            }
            data.extend_from_slice(&chunk);
        }

        debug!("Fetched {} ({} bytes)", filename, data.len());
        Ok(FetchedAttachment {
            filename: filename.to_string(),
            content_type,
            data,
        })
    }
}
