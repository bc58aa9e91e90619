//! The engine: `build_or_get_cache` and `query`
//!
//! Ties the normalizer, ranking, builder, store and executor together, and
//! owns the policies that span them: build coalescing per fingerprint,
//! snapshot tracking, staleness-driven rebuilds and recovery from corrupt
//! entries.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::GenerationBackend;
use crate::builder::{BuildPlan, KnowledgeCacheBuilder};
use crate::cache::{
    start_auto_cleanup, CacheEntry, CacheEntryMetadata, CacheStats, CacheStore, Fingerprint,
    InvalidationReason, StalenessPolicy,
};
use crate::config::EngineConfig;
use crate::error::{CagError, Result};
use crate::executor::{QueryExecutor, QueryResult};
use crate::record::{KnowledgeUnit, RawEvent, RecordNormalizer};
use crate::relevance::{self, RankedUnit};

/// Result of a query call
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Ready(QueryResult),
    /// No live entry for the fingerprint; never answered from empty context
    NotReady {
        fingerprint: Fingerprint,
        rebuilding: bool,
    },
}

impl QueryOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, QueryOutcome::Ready(_))
    }

    pub fn into_result(self) -> Option<QueryResult> {
        match self {
            QueryOutcome::Ready(result) => Some(result),
            QueryOutcome::NotReady { .. } => None,
        }
    }
}

type BuildCell = Arc<OnceCell<Arc<CacheEntry>>>;

struct EngineInner {
    config: EngineConfig,
    store: Arc<CacheStore>,
    backend: Arc<dyn GenerationBackend>,
    normalizer: RecordNormalizer,
    builder: KnowledgeCacheBuilder,
    executor: QueryExecutor,
    staleness: StalenessPolicy,
    /// One cell per fingerprint currently being built
    inflight: Mutex<HashMap<Fingerprint, BuildCell>>,
    /// Snapshot id -> fingerprint currently serving it
    snapshots: RwLock<HashMap<String, Fingerprint>>,
    /// Plans of live fingerprints, kept for background rebuilds
    plans: RwLock<HashMap<Fingerprint, Arc<BuildPlan>>>,
}

/// Cache-augmented generation engine
///
/// Cheap to clone; all clones share the same store and backend.
#[derive(Clone)]
pub struct CagEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CagEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CagEngine")
            .field("backend", &self.inner.backend.name())
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl CagEngine {
    /// Open the store described by `config.cache` and wrap it
    pub async fn open(config: EngineConfig, backend: Arc<dyn GenerationBackend>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CacheStore::open(config.cache.clone()).await?);
        Self::with_store(config, store, backend)
    }

    /// Use an already opened store
    pub fn with_store(
        config: EngineConfig,
        store: Arc<CacheStore>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = EngineInner {
            normalizer: RecordNormalizer::new(config.max_raw_chars, config.max_unit_chars),
            builder: KnowledgeCacheBuilder::new(
                config.effective_budget(),
                config.response_language.clone(),
            ),
            executor: QueryExecutor::new(config.max_tokens_cap, config.generation_timeout),
            staleness: StalenessPolicy::new(config.min_rebuild_severity, config.max_drift_ratio),
            inflight: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            config,
            store,
            backend,
        };

        info!(
            "CAG engine ready (backend: {}, budget: {:?})",
            inner.backend.name(),
            inner.builder.budget()
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.inner.backend
    }

    /// Normalize and rank records the way a build would
    fn prepare(&self, records: &[RawEvent]) -> Result<Vec<KnowledgeUnit>> {
        let batch = self.inner.normalizer.normalize_batch(records);
        if batch.units.is_empty() {
            return Err(CagError::CacheBuild(format!(
                "0 valid records after normalization ({} rejected)",
                batch.rejected
            )));
        }

        let total = batch.units.len();
        Ok(relevance::rank(&batch.units, None, total)
            .into_iter()
            .map(|ranked| ranked.unit)
            .collect())
    }

    /// Return the entry for this corpus, building it if needed
    ///
    /// Concurrent calls that plan the same fingerprint share one build.
    pub async fn build_or_get_cache(
        &self,
        snapshot_id: &str,
        records: &[RawEvent],
        force_rebuild: bool,
    ) -> Result<CacheEntryMetadata> {
        let units = self.prepare(records)?;
        let plan = Arc::new(self.inner.builder.plan(
            snapshot_id,
            &units,
            self.inner.backend.as_ref(),
        )?);
        let fingerprint = plan.fingerprint.clone();
        let previous = self.snapshot(snapshot_id).await;

        let mut supersede_reason = if force_rebuild {
            InvalidationReason::Manual
        } else {
            InvalidationReason::CorpusChanged
        };

        if !force_rebuild {
            if let Ok(entry) = self.inner.store.get(&fingerprint).await {
                debug!("Snapshot '{}' already cached as {}", snapshot_id, fingerprint.short());
                self.remember(snapshot_id, &plan).await;
                self.supersede(previous, &fingerprint, supersede_reason).await?;
                return Ok(entry.metadata.clone());
            }

            if let Some(current) = previous.as_ref().filter(|fp| **fp != fingerprint) {
                if let Ok(entry) = self.inner.store.get(current).await {
                    match self.inner.staleness.assess(&entry, &plan.units) {
                        None => {
                            info!(
                                "Snapshot '{}' changed immaterially, keeping {}",
                                snapshot_id,
                                current.short()
                            );
                            return Ok(entry.metadata.clone());
                        }
                        Some(reason) => {
                            info!(
                                "Snapshot '{}' needs a rebuild: {}",
                                snapshot_id, reason
                            );
                            supersede_reason = reason;
                        }
                    }
                }
            }
        }

        let entry = self.build_coalesced(Arc::clone(&plan), force_rebuild).await?;
        self.remember(snapshot_id, &plan).await;
        self.supersede(previous, &fingerprint, supersede_reason).await?;

        Ok(entry.metadata.clone())
    }

    /// Warm a plan unless an identical build is already running or done
    async fn build_coalesced(&self, plan: Arc<BuildPlan>, force: bool) -> Result<Arc<CacheEntry>> {
        let fingerprint = plan.fingerprint.clone();
        let cell = {
            let mut inflight = self.inner.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(fingerprint.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let result = cell
            .get_or_try_init(|| async {
                if !force {
                    if let Ok(existing) = self.inner.store.get(&fingerprint).await {
                        return Ok(existing);
                    }
                }

                info!(
                    "Building cache {} for '{}' ({} units)",
                    fingerprint.short(),
                    plan.snapshot_id,
                    plan.units.len()
                );
                let entry = self
                    .inner
                    .builder
                    .warm(
                        &plan,
                        self.inner.backend.as_ref(),
                        self.inner.config.cache.ttl_with_jitter(),
                    )
                    .await?;
                self.inner.store.put(entry).await
            })
            .await
            .map(Arc::clone);

        {
            let mut inflight = self.inner.inflight.lock().await;
            if inflight
                .get(&fingerprint)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                inflight.remove(&fingerprint);
            }
        }

        if let Err(e) = &result {
            warn!("Cache build {} failed: {}", fingerprint.short(), e);
        }
        result
    }

    async fn remember(&self, snapshot_id: &str, plan: &Arc<BuildPlan>) {
        self.inner
            .snapshots
            .write()
            .await
            .insert(snapshot_id.to_string(), plan.fingerprint.clone());
        self.inner
            .plans
            .write()
            .await
            .insert(plan.fingerprint.clone(), Arc::clone(plan));
    }

    /// Retire the snapshot's previous entry once it points at `current`
    async fn supersede(
        &self,
        previous: Option<Fingerprint>,
        current: &Fingerprint,
        reason: InvalidationReason,
    ) -> Result<()> {
        match previous {
            Some(old) if old != *current => self.retire(&old, reason).await,
            _ => Ok(()),
        }
    }

    /// Drop a superseded entry unless another snapshot still uses it
    async fn retire(&self, fingerprint: &Fingerprint, reason: InvalidationReason) -> Result<()> {
        let still_used = self
            .inner
            .snapshots
            .read()
            .await
            .values()
            .any(|fp| fp == fingerprint);
        if still_used {
            return Ok(());
        }

        self.inner.plans.write().await.remove(fingerprint);
        self.inner
            .store
            .invalidate_with_reason(fingerprint, reason)
            .await?;
        Ok(())
    }

    /// Fingerprint currently serving a snapshot
    pub async fn snapshot(&self, snapshot_id: &str) -> Option<Fingerprint> {
        self.inner.snapshots.read().await.get(snapshot_id).cloned()
    }

    /// Answer a question from a cached entry
    pub async fn query(
        &self,
        fingerprint: &Fingerprint,
        question: &str,
        max_tokens: Option<usize>,
    ) -> Result<QueryOutcome> {
        self.query_with_cancel(fingerprint, question, max_tokens, &CancellationToken::new())
            .await
    }

    /// Like [`query`](Self::query), abortable through `cancel`
    pub async fn query_with_cancel(
        &self,
        fingerprint: &Fingerprint,
        question: &str,
        max_tokens: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome> {
        let entry = match self.inner.store.get(fingerprint).await {
            Ok(entry) => entry,
            Err(CagError::NotFound(_)) => {
                let rebuilding = self.schedule_rebuild(fingerprint).await;
                debug!(
                    "Query on {} not ready (rebuilding: {})",
                    fingerprint.short(),
                    rebuilding
                );
                return Ok(QueryOutcome::NotReady {
                    fingerprint: fingerprint.clone(),
                    rebuilding,
                });
            }
            Err(e) => return Err(e),
        };

        let max_tokens = max_tokens.unwrap_or(self.inner.config.default_max_tokens);
        match self
            .inner
            .executor
            .execute(
                &entry,
                self.inner.backend.as_ref(),
                question,
                max_tokens,
                cancel,
            )
            .await
        {
            Ok(result) => Ok(QueryOutcome::Ready(result)),
            Err(e) if e.requires_rebuild() => {
                warn!("{}; invalidating entry", e);
                self.inner
                    .store
                    .invalidate_with_reason(fingerprint, InvalidationReason::StateCorruption)
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Start a background rebuild of a known plan; false if none is possible
    async fn schedule_rebuild(&self, fingerprint: &Fingerprint) -> bool {
        if !self.inner.config.auto_rebuild {
            return false;
        }
        let Some(plan) = self.inner.plans.read().await.get(fingerprint).cloned() else {
            return false;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let fingerprint = plan.fingerprint.clone();
            match engine.build_coalesced(plan, false).await {
                Ok(_) => info!("Background rebuild of {} finished", fingerprint.short()),
                Err(e) => warn!("Background rebuild of {} failed: {}", fingerprint.short(), e),
            }
        });
        true
    }

    /// Explicitly drop an entry; the next access rebuilds it
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.inner.store.invalidate(fingerprint).await?.is_some())
    }

    /// Drop every entry and forget all snapshots
    pub async fn clear(&self) -> Result<usize> {
        self.inner.snapshots.write().await.clear();
        self.inner.plans.write().await.clear();
        self.inner.store.clear().await
    }

    pub async fn list_entries(&self) -> Vec<CacheEntryMetadata> {
        self.inner.store.list().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.store.stats().await
    }

    /// Rank records against an optional question without building anything
    pub fn rank(
        &self,
        records: &[RawEvent],
        question: Option<&str>,
        limit: usize,
    ) -> Vec<RankedUnit> {
        let batch = self.inner.normalizer.normalize_batch(records);
        relevance::rank(&batch.units, question, limit)
    }

    /// Run expired-entry cleanup until `shutdown` fires, if enabled
    pub fn spawn_auto_cleanup(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.inner.config.cache.enable_auto_cleanup {
            return None;
        }
        Some(tokio::spawn(start_auto_cleanup(
            Arc::clone(&self.inner.store),
            shutdown,
        )))
    }
}
