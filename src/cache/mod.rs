//! Tiered Image Cache
//!
//! Three tiers, fastest first:
//!
//! - **Memory**: in-process LRU ([`MemoryTier`])
//! - **Persistent**: quota-limited durable store ([`PersistentTier`])
//! - **Origin**: backend API ([`OriginFetcher`])
//!
//! [`ImageCache`] ties them together with request coalescing and the
//! placeholder fallback.

pub mod coordinator;
pub mod entry;
pub mod memory;
pub mod origin;
pub mod persistent;
pub mod placeholder;
pub mod stats;

pub use coordinator::{ImageCache, PrefetchHandle};
pub use entry::{CacheEntry, CacheKey, Payload, ResourceType};
pub use memory::MemoryTier;
pub use origin::{HttpOrigin, OriginFetcher, OriginProvider, Resolution};
pub use persistent::{
    DurableStore, FsStore, InMemoryStore, PersistentTier, StoreRecord, StoreStats,
};
pub use placeholder::placeholder_for;
pub use stats::{CacheStats, StatsSnapshot};
