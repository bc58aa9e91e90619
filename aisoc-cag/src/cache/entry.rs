//! Cache entry: a warmed prefix state plus the units it was built from

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{PrefixState, WarmState};
use crate::cache::types::Fingerprint;
use crate::error::{CagError, Result};
use crate::record::KnowledgeUnit;

/// Everything about an entry except the state blob and the units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub fingerprint: Fingerprint,

    /// Caller's name for the corpus this entry was built from
    pub snapshot_id: String,

    /// Backend that produced the state
    pub backend: String,

    /// Session length right after the prefix
    pub origin_length: usize,

    /// Number of units in the prefix
    pub record_count: usize,

    /// Ranked units that did not fit the budget
    pub dropped_count: usize,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// SHA-256 of the state blob
    pub state_digest: String,

    pub state_bytes: usize,

    /// Highest severity among the cached units
    pub max_severity: u8,
}

impl CacheEntryMetadata {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Time until expiration, `None` once expired
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let now = Utc::now();
        if now > self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}

/// A published knowledge cache
///
/// Immutable once constructed; the store hands out `Arc<CacheEntry>` to
/// concurrent readers.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub metadata: CacheEntryMetadata,
    prefix_state: PrefixState,
    units: Vec<KnowledgeUnit>,
}

impl CacheEntry {
    /// Assemble a fresh entry from a warmed prefix
    pub fn new(
        fingerprint: Fingerprint,
        snapshot_id: impl Into<String>,
        backend: impl Into<String>,
        warm: WarmState,
        units: Vec<KnowledgeUnit>,
        dropped_count: usize,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(3600));

        let metadata = CacheEntryMetadata {
            fingerprint,
            snapshot_id: snapshot_id.into(),
            backend: backend.into(),
            origin_length: warm.origin_length,
            record_count: units.len(),
            dropped_count,
            created_at: now,
            expires_at,
            state_digest: warm.state.digest(),
            state_bytes: warm.state.len(),
            max_severity: units.iter().map(|u| u.severity_level()).max().unwrap_or(0),
        };

        Self {
            metadata,
            prefix_state: warm.state,
            units,
        }
    }

    /// Reassemble an entry from stored parts; callers should `verify_state`
    pub fn from_parts(
        metadata: CacheEntryMetadata,
        prefix_state: PrefixState,
        units: Vec<KnowledgeUnit>,
    ) -> Self {
        Self {
            metadata,
            prefix_state,
            units,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.metadata.fingerprint
    }

    pub fn prefix_state(&self) -> &PrefixState {
        &self.prefix_state
    }

    /// Cached units in prefix order
    pub fn units(&self) -> &[KnowledgeUnit] {
        &self.units
    }

    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired()
    }

    /// Check the blob against the recorded digest
    pub fn verify_state(&self) -> Result<()> {
        if self.prefix_state.len() != self.metadata.state_bytes {
            return Err(CagError::StateCorruption {
                fingerprint: self.metadata.fingerprint.to_string(),
                reason: format!(
                    "state is {} bytes, expected {}",
                    self.prefix_state.len(),
                    self.metadata.state_bytes
                ),
            });
        }
        let digest = self.prefix_state.digest();
        if digest != self.metadata.state_digest {
            return Err(CagError::StateCorruption {
                fingerprint: self.metadata.fingerprint.to_string(),
                reason: "state digest mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Approximate in-memory footprint
    pub fn size_bytes(&self) -> usize {
        let units: usize = self
            .units
            .iter()
            .map(|u| u.text().len() + u.raw_text().len() + u.description().len())
            .sum();
        self.prefix_state.len() + units + std::mem::size_of::<CacheEntryMetadata>()
    }
}
