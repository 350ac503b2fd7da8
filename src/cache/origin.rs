//! Origin Fetch Adapter
//!
//! Per-resource-type retrieval from the backend API. Piece images and
//! collection covers come back as a JSON envelope holding a data URL; post
//! attachments are raw downloads that get converted to a data URL here.
//! Every failure ends in the type's placeholder and one `errors.network`
//! increment.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, instrument};

use super::entry::{CacheEntry, CacheKey, Payload, ResourceType};
use super::placeholder::placeholder_for;
use super::stats::CacheStats;
use crate::config::OriginConfig;
use crate::error::{Error, Result};

// =============================================================================
// Origin Provider Port
// =============================================================================

/// Network source of truth for cached resources
#[async_trait]
pub trait OriginProvider: Send + Sync {
    /// Retrieve the payload for `(resource_type, id)`
    async fn fetch(&self, resource_type: ResourceType, id: u64) -> Result<Payload>;
}

// =============================================================================
// HTTP Provider
// =============================================================================

#[derive(Debug, Deserialize)]
struct DataEnvelope {
    #[serde(default)]
    data: Option<String>,
}

/// [`OriginProvider`] over the backend REST API
pub struct HttpOrigin {
    config: OriginConfig,
    client: Client,
}

impl HttpOrigin {
    /// Create a provider with the configured timeout
    pub fn new(config: OriginConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Endpoint URL for a resource
    pub fn endpoint(&self, resource_type: ResourceType, id: u64) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match resource_type {
            ResourceType::Piece => format!("{}/pieces/{}/image", base, id),
            ResourceType::Collection => format!("{}/collections/{}/cover", base, id),
            ResourceType::PostAttachment => format!("{}/posts/{}/attachment", base, id),
        }
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await.map_err(Error::Network)?;
        if !response.status().is_success() {
            return Err(Error::OriginStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn fetch_envelope(&self, key: CacheKey, url: &str) -> Result<Payload> {
        let envelope: DataEnvelope = self
            .send(url)
            .await?
            .json()
            .await
            .map_err(Error::Network)?;
        parse_envelope(key, envelope)
    }

    async fn fetch_attachment(&self, key: CacheKey, url: &str) -> Result<Payload> {
        let response = self.send(url).await?;
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(essence);
        let bytes = response.bytes().await.map_err(Error::Network)?;
        if bytes.is_empty() {
            return Err(Error::EmptyResponse {
                key: key.to_string(),
            });
        }
        Ok(Payload::binary(bytes, mime))
    }
}

#[async_trait]
impl OriginProvider for HttpOrigin {
    async fn fetch(&self, resource_type: ResourceType, id: u64) -> Result<Payload> {
        let key = CacheKey::new(resource_type, id);
        let url = self.endpoint(resource_type, id);
        debug!(%key, %url, "fetching from origin");

        match resource_type {
            ResourceType::Piece | ResourceType::Collection => self.fetch_envelope(key, &url).await,
            ResourceType::PostAttachment => self.fetch_attachment(key, &url).await,
        }
    }
}

fn parse_envelope(key: CacheKey, envelope: DataEnvelope) -> Result<Payload> {
    match envelope.data {
        Some(data) if !data.is_empty() => Ok(Payload::encoded(data)),
        _ => Err(Error::EmptyResponse {
            key: key.to_string(),
        }),
    }
}

/// `image/png; charset=binary` -> `image/png`
fn essence(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim();
    if mime.is_empty() {
        None
    } else {
        Some(mime.to_ascii_lowercase())
    }
}

// =============================================================================
// Origin Fetch Adapter
// =============================================================================

/// Outcome of an origin round trip
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Validated entry ready for both tiers
    Fetched(CacheEntry),
    /// Fixed placeholder, must not be cached
    Placeholder(Payload),
}

impl Resolution {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Resolution::Placeholder(_))
    }

    pub fn into_payload(self) -> Payload {
        match self {
            Resolution::Fetched(entry) => entry.payload,
            Resolution::Placeholder(payload) => payload,
        }
    }
}

/// Wraps an [`OriginProvider`] with normalization, counting and the
/// placeholder fallback
pub struct OriginFetcher {
    provider: Arc<dyn OriginProvider>,
    stats: Arc<CacheStats>,
}

impl OriginFetcher {
    pub fn new(provider: Arc<dyn OriginProvider>, stats: Arc<CacheStats>) -> Self {
        Self { provider, stats }
    }

    /// Fetch, normalize and validate. Never fails.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn fetch(&self, key: CacheKey) -> Resolution {
        self.stats.record_origin_request();

        match self.try_fetch(key).await {
            Ok(entry) => {
                self.stats.record_origin_success();
                debug!(size = entry.size_bytes, "origin fetch complete");
                Resolution::Fetched(entry)
            }
            Err(e) => {
                self.stats.record_network_error();
                self.stats.record_placeholder();
                error!(error = %e, "failed to load image, serving placeholder");
                Resolution::Placeholder(placeholder_for(key.resource_type()))
            }
        }
    }

    async fn try_fetch(&self, key: CacheKey) -> Result<CacheEntry> {
        let payload = self.provider.fetch(key.resource_type(), key.id()).await?;
        let payload = normalize(payload).await?;
        if payload.is_empty() {
            return Err(Error::EmptyResponse {
                key: key.to_string(),
            });
        }

        let entry = CacheEntry::new(key, payload);
        entry.validate()?;
        Ok(entry)
    }
}

/// Convert binary payloads into the canonical data URL off the async workers
pub async fn normalize(payload: Payload) -> Result<Payload> {
    match payload {
        encoded @ Payload::EncodedText { .. } => Ok(encoded),
        binary @ Payload::Binary { .. } => tokio::task::spawn_blocking(move || binary.into_encoded())
            .await
            .map_err(|e| Error::Internal(format!("payload encoding task failed: {}", e))),
    }
}

// =============================================================================
// Tests
// =============================================================================
