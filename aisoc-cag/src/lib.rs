//! # AISOC knowledge cache (aisoc-cag)
//!
//! Cache-augmented generation over SIEM security events. Instead of
//! retrieving documents per question, a bounded knowledge base of the most
//! relevant events is rendered once, run through a generation backend once,
//! and the resulting prefix state is reused for every question about that
//! snapshot.
//!
//! ## Features
//!
//! - Normalization of heterogeneous Wazuh-style events into compact knowledge units
//! - Severity and keyword ranking with threat-indicator detection
//! - Budgeted prefix documents with content fingerprints
//! - Fingerprint-keyed store with TTL, LRU eviction and crash-safe persistence
//! - Per-query sessions restored from immutable state, with deadlines and cancellation
//! - Offline extractive backend and an OpenAI-compatible HTTP backend
//!
//! ## Building and querying
//!
//! ```no_run
//! use aisoc_cag::{CagEngine, EngineConfig, ExtractiveBackend, RawEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = CagEngine::open(EngineConfig::from_env()?, Arc::new(ExtractiveBackend::new())).await?;
//!
//!     let events = vec![RawEvent::new()
//!         .with("id", "1714557600.1")
//!         .with("timestamp", "2024-05-01T10:00:00Z")
//!         .with("agent_name", "web-01")
//!         .with("rule_level", 10)
//!         .with("rule_description", "sshd: brute force trying to get access")];
//!
//!     let entry = engine.build_or_get_cache("last-24h", &events, false).await?;
//!     let outcome = engine
//!         .query(&entry.fingerprint, "Any brute force attempts?", None)
//!         .await?;
//!
//!     if let Some(result) = outcome.into_result() {
//!         println!("{}", result.answer_text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Persistence
//!
//! Set `cache.persist_dir` (or `CAG_CACHE_DIR`) and entries survive restarts.
//! Entries whose state fails its digest check on load are discarded, never
//! served.

pub mod backend;
pub mod builder;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod record;
pub mod relevance;

// Re-export main types for convenience
pub use backend::{
    ExtractiveBackend, GenerationBackend, GenerationSession, OpenAiCompatBackend,
    OpenAiCompatConfig, PrefixState, Step, WarmState,
};
pub use builder::{Budget, BuildPlan, KnowledgeCacheBuilder};
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheEntryMetadata, CacheStats, CacheStore,
    EntryPersistence, FilePersistence, Fingerprint, InvalidationEvent, InvalidationReason,
    StalenessPolicy,
};
pub use config::EngineConfig;
pub use engine::{CagEngine, QueryOutcome};
pub use error::{CagError, Result};
pub use executor::{Finding, QueryExecutor, QueryResult, Truncation};
pub use record::{KnowledgeUnit, RawEvent, RecordNormalizer, ThreatIndicator, ThreatPriority};
pub use relevance::{QueryTerms, RankedUnit};
