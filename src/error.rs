//! Error types for the image cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the image cache.
///
/// None of these ever reach a caller of [`crate::ImageCache::get`]; they are
/// recovered inside the tier that raised them and only show up as counters.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Origin Errors
    // =========================================================================
    /// Origin endpoint unreachable
    #[error("Origin request failed: {0}")]
    Network(#[source] reqwest::Error),

    /// Origin answered with a non-success status
    #[error("Origin returned HTTP {status} for {url}")]
    OriginStatus { status: u16, url: String },

    /// Origin answered but the envelope carried no usable payload
    #[error("Origin response for {key} is empty")]
    EmptyResponse { key: String },

    // =========================================================================
    // Persistent Tier Errors
    // =========================================================================
    /// Durable store read/write failure not related to quota
    #[error("Persistent tier I/O error: {0}")]
    PersistentIo(String),

    /// Durable store rejected a write for lack of space
    #[error("Quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    /// Stored record failed validation on read
    #[error("Corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Key string is not of the form `{type}:{id}`
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures talking to the origin
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::OriginStatus { .. } | Error::EmptyResponse { .. }
        )
    }

    /// True when the durable store refused a write for space
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
