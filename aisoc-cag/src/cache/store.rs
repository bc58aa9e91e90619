//! Fingerprint-keyed store of published knowledge caches
//!
//! Readers take the shared lock and clone an `Arc<CacheEntry>`; publishing and
//! invalidation swap whole slots under the write lock. Nothing in a published
//! entry is ever edited in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
    config::CacheConfig,
    entry::{CacheEntry, CacheEntryMetadata},
    invalidation::{InvalidationEvent, InvalidationReason},
    persistence::{EntryPersistence, FilePersistence},
    types::{CacheStats, Fingerprint},
};
use crate::error::{CagError, Result};

struct Slot {
    entry: Arc<CacheEntry>,
    size_bytes: usize,
    /// Logical clock value of the last access, for LRU
    last_access: AtomicU64,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<Fingerprint, Slot>,
    size_bytes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions_size: AtomicU64,
    evictions_ttl: AtomicU64,
    invalidations: AtomicU64,
}

/// Knowledge-cache store with TTL, capacity limits and optional persistence
pub struct CacheStore {
    pub(crate) config: CacheConfig,
    inner: RwLock<StoreInner>,
    counters: Counters,
    clock: AtomicU64,
    persistence: Option<Arc<dyn EntryPersistence>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// In-memory store
    pub fn new(config: CacheConfig) -> Self {
        info!("Initializing knowledge cache store with config: {:?}", config);

        Self {
            config,
            inner: RwLock::new(StoreInner::default()),
            counters: Counters::default(),
            clock: AtomicU64::new(0),
            persistence: None,
        }
    }

    /// Store backed by `config.persist_dir` when set; loads surviving entries
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let persistence: Option<Arc<dyn EntryPersistence>> = match &config.persist_dir {
            Some(dir) => Some(Arc::new(FilePersistence::new(dir.clone())?)),
            None => None,
        };

        match persistence {
            Some(persistence) => Self::with_persistence(config, persistence).await,
            None => Ok(Self::new(config)),
        }
    }

    /// Store backed by a custom persistence layer
    pub async fn with_persistence(
        config: CacheConfig,
        persistence: Arc<dyn EntryPersistence>,
    ) -> Result<Self> {
        let loader = Arc::clone(&persistence);
        let loaded = tokio::task::spawn_blocking(move || loader.load_all())
            .await
            .map_err(|e| CagError::Other(format!("persistence loader panicked: {e}")))??;

        let mut store = Self::new(config);
        store.persistence = Some(persistence);

        {
            let mut inner = store.inner.write().await;
            for entry in loaded {
                let entry = Arc::new(entry);
                let size_bytes = entry.size_bytes();
                let tick = store.tick();
                inner.size_bytes += size_bytes;
                inner.entries.insert(
                    entry.fingerprint().clone(),
                    Slot {
                        entry,
                        size_bytes,
                        last_access: AtomicU64::new(tick),
                    },
                );
            }
            info!("Restored {} cache entries", inner.entries.len());
        }

        Ok(store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish an entry, replacing any entry with the same fingerprint
    ///
    /// The entry is made durable before it becomes visible.
    pub async fn put(&self, entry: CacheEntry) -> Result<Arc<CacheEntry>> {
        let entry = Arc::new(entry);
        let size_bytes = entry.size_bytes();

        if size_bytes > self.config.max_size_bytes {
            return Err(CagError::CacheBuild(format!(
                "entry of {} bytes exceeds the store limit of {} bytes",
                size_bytes, self.config.max_size_bytes
            )));
        }

        if let Some(persistence) = &self.persistence {
            let persistence = Arc::clone(persistence);
            let to_save = Arc::clone(&entry);
            tokio::task::spawn_blocking(move || persistence.save(&to_save))
                .await
                .map_err(|e| CagError::Other(format!("persistence writer panicked: {e}")))??;
        }

        let evicted = {
            let mut inner = self.inner.write().await;

            if let Some(old) = inner.entries.remove(entry.fingerprint()) {
                inner.size_bytes = inner.size_bytes.saturating_sub(old.size_bytes);
            }
            let evicted = self.evict_for(&mut inner, size_bytes);

            let tick = self.tick();
            inner.size_bytes += size_bytes;
            inner.entries.insert(
                entry.fingerprint().clone(),
                Slot {
                    entry: Arc::clone(&entry),
                    size_bytes,
                    last_access: AtomicU64::new(tick),
                },
            );
            evicted
        };

        for (fingerprint, reason) in evicted {
            self.forget(&fingerprint).await;
            let event = InvalidationEvent::new(reason, vec![fingerprint.to_string()]);
            info!("Evicted cache entry {} ({})", fingerprint.short(), event.reason);
        }

        info!(
            "Published cache entry {} ({} units, {} state bytes)",
            entry.fingerprint().short(),
            entry.metadata.record_count,
            entry.metadata.state_bytes
        );
        Ok(entry)
    }

    /// Look up a live entry
    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Arc<CacheEntry>> {
        {
            let inner = self.inner.read().await;
            match inner.entries.get(fingerprint) {
                Some(slot) if !slot.entry.is_expired() => {
                    slot.last_access.store(self.tick(), Ordering::Relaxed);
                    self.count(&self.counters.hits);
                    debug!("Cache hit: {}", fingerprint.short());
                    return Ok(Arc::clone(&slot.entry));
                }
                Some(_) => {}
                None => {
                    self.count(&self.counters.misses);
                    debug!("Cache miss: {}", fingerprint.short());
                    return Err(CagError::NotFound(fingerprint.to_string()));
                }
            }
        }

        // expired: remove under the write lock
        let removed = {
            let mut inner = self.inner.write().await;
            let expired = inner
                .entries
                .get(fingerprint)
                .is_some_and(|slot| slot.entry.is_expired());
            if expired {
                Self::remove_slot(&mut inner, fingerprint)
            } else {
                None
            }
        };
        self.count(&self.counters.misses);

        if removed.is_some() {
            self.counters.evictions_ttl.fetch_add(1, Ordering::Relaxed);
            self.forget(fingerprint).await;
            warn!("Cache entry {} expired", fingerprint.short());
        }
        Err(CagError::NotFound(fingerprint.to_string()))
    }

    /// Metadata of a live entry without counting a hit
    pub async fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheEntryMetadata> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(fingerprint)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.metadata.clone())
    }

    pub async fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.peek(fingerprint).await.is_some()
    }

    /// Remove an entry by hand
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<Option<InvalidationEvent>> {
        self.invalidate_with_reason(fingerprint, InvalidationReason::Manual)
            .await
    }

    /// Remove an entry, recording why
    pub async fn invalidate_with_reason(
        &self,
        fingerprint: &Fingerprint,
        reason: InvalidationReason,
    ) -> Result<Option<InvalidationEvent>> {
        let removed = {
            let mut inner = self.inner.write().await;
            Self::remove_slot(&mut inner, fingerprint)
        };

        self.unpersist(fingerprint).await?;

        if removed.is_none() {
            debug!("Nothing to invalidate for {}", fingerprint.short());
            return Ok(None);
        }

        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        let event = InvalidationEvent::new(reason, vec![fingerprint.to_string()]);
        info!(
            "Invalidated cache entry {}: {}",
            fingerprint.short(),
            event.reason
        );
        Ok(Some(event))
    }

    /// Metadata of every live entry, newest first
    pub async fn list(&self) -> Vec<CacheEntryMetadata> {
        let inner = self.inner.read().await;
        let mut listed: Vec<CacheEntryMetadata> = inner
            .entries
            .values()
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.metadata.clone())
            .collect();
        listed.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        listed
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> Result<Vec<InvalidationEvent>> {
        let expired: Vec<Fingerprint> = {
            let mut inner = self.inner.write().await;
            let keys: Vec<Fingerprint> = inner
                .entries
                .iter()
                .filter(|(_, slot)| slot.entry.is_expired())
                .map(|(fp, _)| fp.clone())
                .collect();
            for fp in &keys {
                Self::remove_slot(&mut inner, fp);
            }
            keys
        };

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        for fp in &expired {
            self.forget(fp).await;
        }
        self.counters
            .evictions_ttl
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        let event = InvalidationEvent::new(
            InvalidationReason::Expired,
            expired.iter().map(|fp| fp.to_string()).collect(),
        )
        .with_context(format!("Cleaned up {} expired entries", expired.len()));
        info!("{}", event.context.as_deref().unwrap_or_default());

        Ok(vec![event])
    }

    /// Drop every entry, returning how many were removed
    pub async fn clear(&self) -> Result<usize> {
        let removed: Vec<Fingerprint> = {
            let mut inner = self.inner.write().await;
            inner.size_bytes = 0;
            inner.entries.drain().map(|(fp, _)| fp).collect()
        };

        for fp in &removed {
            self.forget(fp).await;
        }
        self.counters
            .invalidations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);

        info!("Cleared {} entries from cache", removed.len());
        Ok(removed.len())
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        let entries = inner.entries.len();

        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries,
            size_bytes: inner.size_bytes,
            evictions_size: self.counters.evictions_size.load(Ordering::Relaxed),
            evictions_ttl: self.counters.evictions_ttl.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            avg_entry_size: if entries > 0 {
                inner.size_bytes / entries
            } else {
                0
            },
        }
    }

    pub async fn size_bytes(&self) -> usize {
        self.inner.read().await.size_bytes
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    fn count(&self, counter: &AtomicU64) {
        if self.config.enable_metrics {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove_slot(inner: &mut StoreInner, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = inner.entries.remove(fingerprint)?;
        inner.size_bytes = inner.size_bytes.saturating_sub(slot.size_bytes);
        Some(slot)
    }

    /// Remove an entry from durable storage off the async workers
    async fn unpersist(&self, fingerprint: &Fingerprint) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let persistence = Arc::clone(persistence);
        let fingerprint = fingerprint.clone();
        tokio::task::spawn_blocking(move || persistence.remove(&fingerprint))
            .await
            .map_err(|e| CagError::Other(format!("persistence remover panicked: {e}")))?
    }

    /// Best-effort removal from durable storage
    async fn forget(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.unpersist(fingerprint).await {
            warn!(
                "Failed to remove persisted entry {}: {}",
                fingerprint.short(),
                e
            );
        }
    }

    /// Make room for `needed` bytes and one more entry
    fn evict_for(
        &self,
        inner: &mut StoreInner,
        needed: usize,
    ) -> Vec<(Fingerprint, InvalidationReason)> {
        let mut evicted = Vec::new();

        loop {
            let over_count = inner.entries.len() >= self.config.max_entries;
            let over_size = inner.size_bytes + needed > self.config.max_size_bytes;
            if !over_count && !over_size {
                break;
            }

            let victim = if self.config.enable_lru_eviction {
                inner
                    .entries
                    .iter()
                    .min_by_key(|(fp, slot)| (slot.last_access.load(Ordering::Relaxed), (*fp).clone()))
                    .map(|(fp, _)| fp.clone())
            } else {
                inner
                    .entries
                    .iter()
                    .min_by_key(|(fp, slot)| (slot.entry.metadata.created_at, (*fp).clone()))
                    .map(|(fp, _)| fp.clone())
            };

            let Some(victim) = victim else {
                break;
            };
            Self::remove_slot(inner, &victim);
            self.counters.evictions_size.fetch_add(1, Ordering::Relaxed);

            let reason = if over_size {
                InvalidationReason::SizeLimit
            } else {
                InvalidationReason::LeastRecentlyUsed
            };
            debug!("Evicting entry {} ({})", victim.short(), reason);
            evicted.push((victim, reason));
        }

        evicted
    }
}

/// Background task for automatic cache cleanup
///
/// Runs until `shutdown` is cancelled.
pub async fn start_auto_cleanup(store: Arc<CacheStore>, shutdown: CancellationToken) {
    let interval = store.config.cleanup_interval;

    info!(
        "Starting automatic cache cleanup task (interval: {:?})",
        interval
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Auto cleanup stopped");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match store.cleanup_expired().await {
            Ok(events) => {
                if !events.is_empty() {
                    debug!("Auto cleanup: {} events", events.len());
                }
            }
            Err(e) => {
                warn!("Auto cleanup failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PrefixState, WarmState};
    use crate::record::{RawEvent, RecordNormalizer};
    use std::time::Duration;

    fn entry(fp: &str, ttl: Duration) -> CacheEntry {
        let unit = RecordNormalizer::default()
            .normalize(
                &RawEvent::new()
                    .with("id", fp)
                    .with("timestamp", "2024-05-01T10:00:00Z")
                    .with("rule_level", 5)
                    .with("rule_description", "port scan detected"),
            )
            .unwrap();
        CacheEntry::new(
            Fingerprint::new(fp),
            "snap",
            "extractive",
            WarmState {
                state: PrefixState::new(vec![7u8; 64]),
                origin_length: 8,
            },
            vec![unit],
            0,
            ttl,
        )
    }

    fn config() -> CacheConfig {
        CacheConfig::builder()
            .default_ttl(Duration::from_secs(60))
            .ttl_jitter(0.0)
            .build()
    }

    #[tokio::test]
    async fn test_basic_put_and_get() {
        let store = CacheStore::new(config());
        store.put(entry("a1", Duration::from_secs(60))).await.unwrap();

        let found = store.get(&Fingerprint::new("a1")).await.unwrap();
        assert_eq!(found.fingerprint().as_str(), "a1");

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let store = CacheStore::new(config());

        let result = store.get(&Fingerprint::new("ffff")).await;
        assert!(matches!(result, Err(CagError::NotFound(_))));
        assert_eq!(store.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let store = CacheStore::new(config());
        store
            .put(entry("b2", Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(store.get(&Fingerprint::new("b2")).await.is_ok());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.get(&Fingerprint::new("b2")).await.is_err());
        assert_eq!(store.stats().await.evictions_ttl, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let store = CacheStore::new(
            CacheConfig::builder()
                .max_entries(3)
                .enable_lru_eviction(true)
                .build(),
        );

        for fp in ["c1", "c2", "c3"] {
            store.put(entry(fp, Duration::from_secs(60))).await.unwrap();
        }
        // touch c1 so c2 becomes least recently used
        store.get(&Fingerprint::new("c1")).await.unwrap();
        store.put(entry("c4", Duration::from_secs(60))).await.unwrap();

        assert!(store.contains(&Fingerprint::new("c1")).await);
        assert!(!store.contains(&Fingerprint::new("c2")).await);
        assert!(store.contains(&Fingerprint::new("c3")).await);
        assert!(store.contains(&Fingerprint::new("c4")).await);
        assert_eq!(store.stats().await.evictions_size, 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_rejected() {
        let store = CacheStore::new(CacheConfig::builder().max_size_bytes(16).build());
        let result = store.put(entry("d1", Duration::from_secs(60))).await;
        assert!(matches!(result, Err(CagError::CacheBuild(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let store = CacheStore::new(config());
        store.put(entry("e1", Duration::from_secs(60))).await.unwrap();

        let event = store
            .invalidate(&Fingerprint::new("e1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, InvalidationReason::Manual);
        assert!(store.get(&Fingerprint::new("e1")).await.is_err());

        // second time is a no-op
        assert!(store.invalidate(&Fingerprint::new("e1")).await.unwrap().is_none());
        assert_eq!(store.stats().await.invalidations, 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_single_slot() {
        let store = CacheStore::new(config());
        store.put(entry("f1", Duration::from_secs(60))).await.unwrap();
        let size = store.size_bytes().await;
        store.put(entry("f1", Duration::from_secs(60))).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.size_bytes().await, size);
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let store = CacheStore::new(config());
        store.put(entry("a1", Duration::from_secs(60))).await.unwrap();
        store.put(entry("b1", Duration::from_secs(60))).await.unwrap();

        assert_eq!(store.list().await.len(), 2);

        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.is_empty().await);
        assert_eq!(store.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_evicted_and_invalidated_entries_leave_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let persistence = Arc::new(FilePersistence::new(tmp.path()).unwrap());
        let store = CacheStore::with_persistence(
            CacheConfig::builder().max_entries(1).ttl_jitter(0.0).build(),
            persistence.clone(),
        )
        .await
        .unwrap();

        store.put(entry("a1", Duration::from_secs(60))).await.unwrap();
        store.put(entry("b1", Duration::from_secs(60))).await.unwrap();

        let on_disk: Vec<Fingerprint> = persistence
            .load_all()
            .unwrap()
            .iter()
            .map(|e| e.fingerprint().clone())
            .collect();
        assert_eq!(on_disk, vec![Fingerprint::new("b1")]);

        store.invalidate(&Fingerprint::new("b1")).await.unwrap();
        assert!(persistence.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = CacheStore::new(config());
        store.put(entry("a1", Duration::from_millis(50))).await.unwrap();
        store.put(entry("b1", Duration::from_millis(50))).await.unwrap();
        store.put(entry("c1", Duration::from_secs(60))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = store.cleanup_expired().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fingerprints.len(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_auto_cleanup_stops_on_cancel() {
        let store = Arc::new(CacheStore::new(
            CacheConfig::builder()
                .cleanup_interval(Duration::from_millis(20))
                .build(),
        ));
        store.put(entry("a1", Duration::from_millis(10))).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(start_auto_cleanup(Arc::clone(&store), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_empty().await);

        shutdown.cancel();
        task.await.unwrap();
    }
}
