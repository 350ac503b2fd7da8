//! Cache Entry Types
//!
//! Keys, payloads and entries shared by every tier. A [`CacheKey`] serializes
//! to `"{type}:{id}"`, which is the lookup key in memory, in the durable
//! store and in the in-flight table.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fallback MIME type for binary payloads without a content type
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Current wall-clock time in epoch milliseconds
#[inline]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Resource Type
// =============================================================================

/// Closed classification of cached resources.
///
/// Determines the origin retrieval method and the placeholder image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Piece score image
    #[serde(rename = "piece")]
    Piece,
    /// Collection cover
    #[serde(rename = "collection")]
    Collection,
    /// Post attachment
    #[serde(rename = "post")]
    PostAttachment,
}

impl ResourceType {
    /// Every resource type, in key order
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Piece,
        ResourceType::Collection,
        ResourceType::PostAttachment,
    ];

    /// Prefix used in serialized keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Piece => "piece",
            ResourceType::Collection => "collection",
            ResourceType::PostAttachment => "post",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "piece" => Ok(ResourceType::Piece),
            "collection" => Ok(ResourceType::Collection),
            "post" | "attachment" | "post-attachment" => Ok(ResourceType::PostAttachment),
            other => Err(Error::InvalidKey(format!("unknown resource type '{}'", other))),
        }
    }
}

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key - composite of resource type and numeric id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey {
    resource_type: ResourceType,
    id: u64,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(resource_type: ResourceType, id: u64) -> Self {
        Self { resource_type, id }
    }

    /// Resource type component
    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Numeric id component
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.id)
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidKey(s.to_string()))?;
        let resource_type = kind.parse()?;
        let id = id
            .parse::<u64>()
            .map_err(|_| Error::InvalidKey(s.to_string()))?;
        Ok(Self::new(resource_type, id))
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Cached image payload.
///
/// Origins may hand back raw bytes; the origin adapter converts them to the
/// canonical [`Payload::EncodedText`] data URL before they are cached.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Raw bytes with an optional MIME type
    Binary {
        #[serde(with = "base64_bytes")]
        bytes: Bytes,
        mime: Option<String>,
    },
    /// Base64 data URL, e.g. `data:image/png;base64,iVBOR...`
    EncodedText { text: Arc<str> },
}

impl Payload {
    /// Wrap an encoded data URL
    pub fn encoded(text: impl Into<Arc<str>>) -> Self {
        Payload::EncodedText { text: text.into() }
    }

    /// Wrap raw bytes
    pub fn binary(bytes: impl Into<Bytes>, mime: Option<String>) -> Self {
        Payload::Binary {
            bytes: bytes.into(),
            mime,
        }
    }

    /// Encoded text, if this is a data URL payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::EncodedText { text } => Some(text),
            Payload::Binary { .. } => None,
        }
    }

    /// True when there is nothing to serve
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Binary { bytes, .. } => bytes.is_empty(),
            Payload::EncodedText { text } => text.is_empty(),
        }
    }

    /// Size of the decoded content in bytes.
    ///
    /// For data URLs this is derived from the base64 body length minus
    /// padding, so both representations of the same image agree.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Payload::Binary { bytes, .. } => bytes.len() as u64,
            Payload::EncodedText { text } => base64_decoded_len(data_url_body(text)),
        }
    }

    /// MIME type carried by the payload
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Payload::Binary { mime, .. } => mime.as_deref(),
            Payload::EncodedText { text } => data_url_mime(text),
        }
    }

    /// Convert to the canonical data URL form
    pub fn into_encoded(self) -> Payload {
        match self {
            Payload::Binary { bytes, mime } => {
                let mime = mime.as_deref().unwrap_or(OCTET_STREAM);
                let text = format!("data:{};base64,{}", mime, STANDARD.encode(&bytes));
                Payload::encoded(text)
            }
            encoded @ Payload::EncodedText { .. } => encoded,
        }
    }

    /// Decoded image bytes
    pub fn decode(&self) -> Result<Bytes> {
        match self {
            Payload::Binary { bytes, .. } => Ok(bytes.clone()),
            Payload::EncodedText { text } => {
                if data_url_mime(text).is_none() {
                    return Err(Error::Internal("payload is not a base64 data URL".into()));
                }
                STANDARD
                    .decode(data_url_body(text))
                    .map(Bytes::from)
                    .map_err(|e| Error::Internal(format!("base64 decode failed: {}", e)))
            }
        }
    }

    /// Check the encoding marker of the payload
    fn check_encoding(&self) -> std::result::Result<(), &'static str> {
        match self {
            Payload::Binary { .. } => Ok(()),
            Payload::EncodedText { text } => {
                if data_url_mime(text).is_some() {
                    Ok(())
                } else {
                    Err("missing base64 data URL marker")
                }
            }
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Binary { bytes, mime } => f
                .debug_struct("Binary")
                .field("len", &bytes.len())
                .field("mime", mime)
                .finish(),
            Payload::EncodedText { text } => f
                .debug_struct("EncodedText")
                .field("len", &text.len())
                .field("mime", &data_url_mime(text))
                .finish(),
        }
    }
}

/// MIME type of a `data:<mime>;base64,` URL
fn data_url_mime(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("data:")?;
    let (header, _) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    if mime.is_empty() {
        None
    } else {
        Some(mime)
    }
}

/// Base64 body of a data URL, or the whole string when there is no header
fn data_url_body(text: &str) -> &str {
    match data_url_mime(text) {
        Some(_) => text.split_once(',').map(|(_, body)| body).unwrap_or(""),
        None => text,
    }
}

/// floor(len * 3 / 4) - padding
fn base64_decoded_len(body: &str) -> u64 {
    let padding = body.bytes().rev().take_while(|b| *b == b'=').count() as u64;
    ((body.len() as u64) * 3 / 4).saturating_sub(padding)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Cache entry containing a payload and its bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Lookup key
    pub key: CacheKey,
    /// Cached image
    pub payload: Payload,
    /// Decoded size, identical in every tier
    pub size_bytes: u64,
    /// Last access time (epoch milliseconds)
    pub last_access: i64,
    /// Number of times the entry has been served
    pub access_count: u64,
    /// MIME type, when known
    pub mime_type: Option<String>,
}

impl CacheEntry {
    /// Create a fresh entry stamped with the current time
    pub fn new(key: CacheKey, payload: Payload) -> Self {
        let size_bytes = payload.size_bytes();
        let mime_type = payload.mime_type().map(str::to_string);
        Self {
            key,
            payload,
            size_bytes,
            last_access: now_millis(),
            access_count: 1,
            mime_type,
        }
    }

    /// Record an access
    #[inline]
    pub fn touch(&mut self) -> u64 {
        self.last_access = now_millis().max(self.last_access);
        self.access_count += 1;
        self.access_count
    }

    /// Strict validation used before anything read from the durable store is
    /// promoted into memory.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: &str| Error::CorruptEntry {
            key: self.key.to_string(),
            reason: reason.to_string(),
        };

        if self.payload.is_empty() {
            return Err(corrupt("empty payload"));
        }
        self.payload.check_encoding().map_err(corrupt)?;
        if self.last_access <= 0 {
            return Err(corrupt("non-positive access timestamp"));
        }
        if self.size_bytes != self.payload.size_bytes() {
            return Err(corrupt("recorded size does not match payload"));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
