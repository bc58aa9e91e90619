//! Knowledge-cache store
//!
//! Maps content fingerprints to warmed prefix states:
//! - Shared-read, atomic-replace access through `tokio::sync::RwLock`
//! - TTL expiration with jitter and background cleanup
//! - Entry-count and size limits with LRU eviction
//! - Optional durable persistence with crash-safe writes
//! - Staleness policy deciding when a corpus change warrants a rebuild

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod persistence;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{CacheEntry, CacheEntryMetadata};
pub use invalidation::{InvalidationEvent, InvalidationReason, StalenessPolicy};
pub use persistence::{EntryPersistence, FilePersistence};
pub use store::{start_auto_cleanup, CacheStore};
pub use types::{CacheStats, Fingerprint};
