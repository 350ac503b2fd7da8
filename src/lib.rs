//! Choir Image Cache - Tiered Image Cache
//!
//! Serves piece scores, collection covers and post attachments with minimal
//! latency and bounded memory and disk usage.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐
//!  get ────▶ │  ImageCache  │  coalescing, invalidation, bulk preload
//!            └──────┬───────┘
//!     ┌─────────────┼──────────────┐
//!     ▼             ▼              ▼
//! ┌────────┐  ┌────────────┐  ┌──────────┐
//! │ Memory │  │ Persistent │  │  Origin  │
//! │  (LRU) │  │  (quota)   │  │  (HTTP)  │
//! └────────┘  └────────────┘  └──────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, coordinator, statistics and placeholders
//! - [`config`] - Limits and origin settings
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus text exposition

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cache::{
    CacheKey, DurableStore, FsStore, HttpOrigin, ImageCache, InMemoryStore, OriginProvider,
    Payload, PrefetchHandle, ResourceType, StatsSnapshot,
};
pub use config::{CacheConfig, OriginConfig, TierConfig};
pub use error::{Error, Result};
