//! Cache invalidation reasons and the staleness policy
//!
//! Entries leave the store when their TTL runs out, when capacity forces an
//! eviction, when a caller asks, when their state turns out to be corrupt, or
//! when the corpus they were built from has materially changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::entry::CacheEntry;
use crate::record::{KnowledgeUnit, ThreatPriority};

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry expired based on TTL
    Expired,

    /// Explicit invalidation or forced rebuild
    Manual,

    /// Too much of the corpus changed since the entry was built
    CorpusChanged,

    /// A new event at or above the rebuild severity arrived
    HighSeverityEvent { severity: u8 },

    /// The stored state failed verification or could not be restored
    StateCorruption,

    /// Evicted due to cache size limits
    SizeLimit,

    /// Evicted by LRU policy
    LeastRecentlyUsed,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::CorpusChanged => write!(f, "corpus changed"),
            InvalidationReason::HighSeverityEvent { severity } => {
                write!(f, "new high-severity event (level {})", severity)
            }
            InvalidationReason::StateCorruption => write!(f, "state corruption"),
            InvalidationReason::SizeLimit => write!(f, "cache size limit reached"),
            InvalidationReason::LeastRecentlyUsed => write!(f, "LRU eviction"),
        }
    }
}

/// Event for cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Fingerprints that were invalidated
    pub fingerprints: Vec<String>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    pub fn new(reason: InvalidationReason, fingerprints: Vec<String>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            fingerprints,
            context: None,
        }
    }

    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }
}

/// Decides whether a newly planned unit set warrants replacing a fresh entry
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    /// New or changed units at this level or above force a rebuild
    pub min_rebuild_severity: u8,

    /// Fraction of changed units above which the corpus counts as changed
    pub max_drift_ratio: f64,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            min_rebuild_severity: ThreatPriority::High.min_level(),
            max_drift_ratio: 0.25,
        }
    }
}

impl StalenessPolicy {
    pub fn new(min_rebuild_severity: u8, max_drift_ratio: f64) -> Self {
        Self {
            min_rebuild_severity,
            max_drift_ratio,
        }
    }

    /// Compare the serving entry with a newly planned unit set
    ///
    /// Returns `None` when the entry may keep serving.
    pub fn assess(
        &self,
        current: &CacheEntry,
        planned: &[KnowledgeUnit],
    ) -> Option<InvalidationReason> {
        let cached: HashMap<&str, &KnowledgeUnit> = current
            .units()
            .iter()
            .map(|u| (u.source_id(), u))
            .collect();
        let planned_ids: HashMap<&str, &KnowledgeUnit> =
            planned.iter().map(|u| (u.source_id(), u)).collect();

        // added or rewritten since the entry was built
        let fresh: Vec<&KnowledgeUnit> = planned
            .iter()
            .filter(|u| match cached.get(u.source_id()) {
                Some(old) => old.text() != u.text(),
                None => true,
            })
            .collect();
        let removed = cached
            .keys()
            .filter(|id| !planned_ids.contains_key(*id))
            .count();

        if let Some(severity) = fresh
            .iter()
            .map(|u| u.severity_level())
            .filter(|level| *level >= self.min_rebuild_severity)
            .max()
        {
            return Some(InvalidationReason::HighSeverityEvent { severity });
        }

        let changed = fresh.len() + removed;
        if changed == 0 {
            return None;
        }
        let base = cached.len().max(planned.len()).max(1);
        let drift = changed as f64 / base as f64;
        if drift > self.max_drift_ratio {
            Some(InvalidationReason::CorpusChanged)
        } else {
            None
        }
    }
}
