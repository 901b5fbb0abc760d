//! Cache-aside manager for related-item relations.
//!
//! A lookup checks the store first and computes on a miss. Computation runs
//! on a worker thread bounded by [`ManagerOptions::compute_timeout`]; when it
//! fails, times out or finds nothing, the [`FallbackStrategy`] supplies a flat
//! scored set instead. A miss therefore always resolves to a cached state
//! unless the store itself refuses the write.
//!
//! Concurrent misses for the same reference are serialized through a claim
//! table, so at most one computation per reference runs at a time. A clear
//! that lands while a computation runs wins: the result is discarded and
//! recomputed if it mentions any cleared id.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::algo::candidates::CandidateSelector;
use crate::algo::fallback::FallbackStrategy;
use crate::algo::similarity::Scorer;
use crate::catalog::{Catalog, ItemFilter};
use crate::config::AlgorithmConfig;
use crate::error::{CatalogError, ComputeError, Result, StoreError};
use crate::model::{unix_now, CacheState, Item, ItemId, ScoredRelation, EMPTY_MARKER};
use crate::store::RelationStore;

/// Multiplier applied when the candidate already lists the reference.
pub const CROSS_REFERENCE_BOOST: f64 = 1.1;

/// Computations discarded because their inputs were cleared mid-flight
/// before the manager gives up and leaves the reference uncached.
const MAX_COMPUTE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Upper bound for one computation (and separately for its fallback).
    /// `None` computes inline on the calling thread.
    pub compute_timeout: Option<Duration>,
    /// How long a miss waits for another thread's computation of the same id.
    pub claim_timeout: Duration,
    /// Memoized relation lists kept in process. Zero disables the layer.
    pub read_through_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            compute_timeout: Some(Duration::from_secs(10)),
            claim_timeout: Duration::from_secs(30),
            read_through_capacity: 1024,
        }
    }
}

/// Aggregate view over the cache plus catalog size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_items: usize,
    pub cached_items: usize,
    pub total_relations: usize,
    pub avg_relations_per_item: f64,
    pub cache_coverage_pct: f64,
    pub avg_score: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Claim table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClaimTable {
    active: Mutex<HashSet<ItemId>>,
    released: Condvar,
}

struct Claim<'a> {
    table: &'a ClaimTable,
    id: ItemId,
}

impl ClaimTable {
    /// Wait until nobody holds `id`, then hold it. `None` on timeout.
    fn claim(&self, id: ItemId, timeout: Duration) -> Option<Claim<'_>> {
        let deadline = Instant::now() + timeout;
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        while active.contains(&id) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(active, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            active = guard;
        }
        active.insert(id);
        Some(Claim { table: self, id })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut active = self
            .table
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        active.remove(&self.id);
        self.table.released.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Invalidation log
// ---------------------------------------------------------------------------

/// Clears recorded against a generation counter, so a computation can tell
/// whether anything it read was invalidated before it got to write.
#[derive(Default)]
struct Invalidations {
    generation: u64,
    cleared: HashMap<ItemId, u64>,
    cleared_all: u64,
    in_flight: usize,
}

impl Invalidations {
    fn touched_since(&self, since: u64, ids: impl IntoIterator<Item = ItemId>) -> bool {
        self.cleared_all > since
            || ids
                .into_iter()
                .any(|id| self.cleared.get(&id).is_some_and(|&at| at > since))
    }
}

#[derive(Default)]
struct InvalidationLog {
    state: Mutex<Invalidations>,
}

/// One computation's view of the log. Entries are pruned once no
/// computation is in flight.
struct Ticket<'a> {
    log: &'a InvalidationLog,
    since: u64,
}

impl InvalidationLog {
    fn lock(&self) -> std::sync::MutexGuard<'_, Invalidations> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Ticket<'_> {
        let mut state = self.lock();
        state.in_flight += 1;
        Ticket {
            log: self,
            since: state.generation,
        }
    }

    fn record(&self, ids: impl IntoIterator<Item = ItemId>) {
        let mut state = self.lock();
        state.generation += 1;
        let at = state.generation;
        for id in ids {
            state.cleared.insert(id, at);
        }
    }

    fn record_all(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.cleared_all = state.generation;
        state.cleared.clear();
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut state = self.log.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            state.cleared.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Read-through layer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Memo {
    /// Bumped by every eviction; a load that started in an older epoch is
    /// not memoized.
    epoch: u64,
    entries: HashMap<ItemId, Arc<Vec<ScoredRelation>>>,
}

struct ReadThrough {
    capacity: usize,
    memo: Mutex<Memo>,
}

impl ReadThrough {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            memo: Mutex::new(Memo::default()),
        }
    }

    fn enabled(&self) -> bool {
        self.capacity > 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Memo> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: ItemId) -> Option<Arc<Vec<ScoredRelation>>> {
        self.lock().entries.get(&id).cloned()
    }

    fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    fn insert(&self, epoch: u64, id: ItemId, rows: Arc<Vec<ScoredRelation>>) {
        let mut memo = self.lock();
        if memo.epoch != epoch {
            return;
        }
        if memo.entries.len() >= self.capacity && !memo.entries.contains_key(&id) {
            memo.entries.clear();
        }
        memo.entries.insert(id, rows);
    }

    fn evict(&self, ids: impl IntoIterator<Item = ItemId>) {
        let mut memo = self.lock();
        memo.epoch += 1;
        for id in ids {
            memo.entries.remove(&id);
        }
    }

    fn flush(&self) {
        let mut memo = self.lock();
        memo.epoch += 1;
        memo.entries.clear();
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// Everything a computation needs, cheap to clone into a worker thread.
#[derive(Clone)]
struct Engine {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn RelationStore>,
    scorer: Arc<dyn Scorer>,
    selector: CandidateSelector,
    fallback: FallbackStrategy,
}

enum Resolution {
    NotFound,
    Relations(BTreeMap<ItemId, f64>),
}

impl Engine {
    /// Scored relations against every candidate, unfiltered by threshold or
    /// limit. `None` when the reference is not in the catalog.
    fn primary(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<Option<BTreeMap<ItemId, f64>>, ComputeError> {
        let Some(reference) = self.catalog.get_item(id)? else {
            return Ok(None);
        };
        let candidates = self.selector.select(&reference, self.catalog.as_ref(), config)?;

        let scored = candidates
            .par_iter()
            .map(|candidate| {
                self.scorer
                    .score(&reference, candidate, config)
                    .map(|score| (candidate.id, score))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut relations = BTreeMap::new();
        for (candidate, mut score) in scored {
            if config.boosts.cross_reference && self.lists(candidate, id) {
                score *= CROSS_REFERENCE_BOOST;
            }
            if score.is_finite() && score > 0.0 {
                relations.insert(candidate, score);
            }
        }
        Ok(Some(relations))
    }

    fn fallback(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<Option<BTreeMap<ItemId, f64>>, ComputeError> {
        let Some(reference) = self.catalog.get_item(id)? else {
            return Ok(None);
        };
        let (tier, relations) =
            self.fallback
                .relations(&reference, self.catalog.as_ref(), config)?;
        debug!(reference = id, tier = ?tier, relations = relations.len(), "fallback relations");
        Ok(Some(relations.into_iter().collect()))
    }

    /// True when `reference`'s cached set already contains `related`.
    fn lists(&self, reference: ItemId, related: ItemId) -> bool {
        match self.store.score(reference, related) {
            Ok(score) => score.is_some(),
            Err(e) => {
                debug!(reference, related, error = %e, "cross-reference lookup failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cache manager
// ---------------------------------------------------------------------------

/// Cache-aside front for one relation store.
pub struct CacheManager {
    engine: Engine,
    options: ManagerOptions,
    claims: ClaimTable,
    invalidations: InvalidationLog,
    read_through: ReadThrough,
}

impl CacheManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn RelationStore>,
        scorer: Arc<dyn Scorer>,
    ) -> Self {
        let options = ManagerOptions::default();
        Self {
            engine: Engine {
                catalog,
                store,
                scorer,
                selector: CandidateSelector::default(),
                fallback: FallbackStrategy::default(),
            },
            options,
            claims: ClaimTable::default(),
            invalidations: InvalidationLog::default(),
            read_through: ReadThrough::new(options.read_through_capacity),
        }
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.read_through = ReadThrough::new(options.read_through_capacity);
        self.options = options;
        self
    }

    pub fn with_selector(mut self, selector: CandidateSelector) -> Self {
        self.engine.selector = selector;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.engine.fallback = fallback;
        self
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.engine.catalog
    }

    pub fn store_handle(&self) -> &Arc<dyn RelationStore> {
        &self.engine.store
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// True iff any row, the empty marker included, exists for `id`.
    pub fn is_cached(&self, id: ItemId) -> Result<bool, StoreError> {
        Ok(self.engine.store.state(id)?.is_cached())
    }

    pub fn state(&self, id: ItemId) -> Result<CacheState, StoreError> {
        self.engine.store.state(id)
    }

    /// Compute and store relations for `id` unless already cached.
    ///
    /// Returns `Absent` when the reference is not in the catalog, when
    /// waiting for a concurrent computation of the same id timed out, or when
    /// its inputs were cleared during every attempt.
    pub fn enforce_cache(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<CacheState, StoreError> {
        let state = self.engine.store.state(id)?;
        if state.is_cached() {
            return Ok(state);
        }

        let Some(_claim) = self.claims.claim(id, self.options.claim_timeout) else {
            warn!(reference = id, "timed out waiting for a concurrent computation");
            return self.engine.store.state(id);
        };

        // another thread may have filled it while we waited
        let state = self.engine.store.state(id)?;
        if state.is_cached() {
            return Ok(state);
        }

        let config = effective(config);
        match self.compute_and_store(id, &config)? {
            Some(state) => Ok(state),
            None => {
                debug!(reference = id, "reference not in catalog");
                Ok(CacheState::Absent)
            }
        }
    }

    /// Recompute `id` and atomically replace whatever was cached. A reference
    /// that vanished from the catalog has its rows cleared instead.
    pub fn rebuild_item(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<CacheState, StoreError> {
        let Some(_claim) = self.claims.claim(id, self.options.claim_timeout) else {
            warn!(reference = id, "timed out waiting for a concurrent computation");
            return self.engine.store.state(id);
        };
        let config = effective(config);
        match self.compute_and_store(id, &config)? {
            Some(state) => Ok(state),
            None => {
                self.clear([id])?;
                Ok(CacheState::Absent)
            }
        }
    }

    /// Relations of `id` with `score >= threshold`, best first, at most
    /// `limit`. Computes on a miss.
    pub fn get_related(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<Vec<ScoredRelation>, StoreError> {
        let config = effective(config);
        self.enforce_cache(id, &config)?;

        if !self.read_through.enabled() {
            return self.engine.store.related(id, config.threshold, config.limit);
        }
        let rows = self.cached_relations(id)?;
        Ok(rows
            .iter()
            .filter(|r| r.score >= config.threshold)
            .take(config.limit)
            .cloned()
            .collect())
    }

    pub fn get_related_ids(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<Vec<ItemId>, StoreError> {
        Ok(self
            .get_related(id, config)?
            .into_iter()
            .map(|r| r.related_id)
            .collect())
    }

    /// Atomically replace every row of `id`. An empty (or fully filtered)
    /// map writes the empty marker. On a failed write the marker is still
    /// attempted before the error is returned.
    pub fn store(
        &self,
        id: ItemId,
        relations: &BTreeMap<ItemId, f64>,
    ) -> Result<CacheState, StoreError> {
        self.write(id, relations)
    }

    fn write(
        &self,
        id: ItemId,
        relations: &BTreeMap<ItemId, f64>,
    ) -> Result<CacheState, StoreError> {
        let computed_at = unix_now();
        let rows: Vec<ScoredRelation> = relations
            .iter()
            .filter(|&(&related, &score)| {
                related != id && related != EMPTY_MARKER && score.is_finite() && score >= 0.0
            })
            .map(|(&related, &score)| ScoredRelation {
                reference_id: id,
                related_id: related,
                score,
                computed_at,
            })
            .collect();

        let result = self.engine.store.replace(id, &rows);
        self.read_through.evict([id]);

        match result {
            Ok(()) => {
                debug!(reference = id, relations = rows.len(), "stored relations");
                Ok(if rows.is_empty() {
                    CacheState::Empty
                } else {
                    CacheState::Populated(rows.len())
                })
            }
            Err(e) => {
                error!(reference = id, error = %e, "failed to store relations");
                if let Err(marker) = self.engine.store.ensure_marker(id) {
                    error!(reference = id, error = %marker, "failed to write empty marker");
                }
                Err(e)
            }
        }
    }

    /// Drop every row where any of `ids` is the reference or the related
    /// side. Returns the number of rows deleted.
    pub fn clear(&self, ids: impl IntoIterator<Item = ItemId>) -> Result<usize, StoreError> {
        let ids: BTreeSet<ItemId> = ids.into_iter().filter(|&id| id != EMPTY_MARKER).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        self.invalidations.record(ids.iter().copied());

        let mut evict: Vec<ItemId> = ids.iter().copied().collect();
        let mut flush = false;
        for &id in &ids {
            match self.engine.store.referencing(id) {
                Ok(refs) => evict.extend(refs.into_keys()),
                Err(e) => {
                    warn!(related = id, error = %e, "reverse lookup failed, flushing read-through layer");
                    flush = true;
                }
            }
        }

        let result = self.engine.store.remove(&ids);
        if flush {
            self.read_through.flush();
        } else {
            self.read_through.evict(evict);
        }
        let removed = result?;
        info!(ids = ?ids, removed, "cleared cached relations");
        Ok(removed)
    }

    /// Drop every row and flush the read-through layer.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        self.invalidations.record_all();
        let result = self.engine.store.truncate();
        self.read_through.flush();
        let removed = result?;
        info!(removed, "cleared relation cache");
        Ok(removed)
    }

    pub fn get_score(&self, reference: ItemId, related: ItemId) -> Result<Option<f64>, StoreError> {
        self.engine.store.score(reference, related)
    }

    /// Which references currently list `related`, with their scores.
    pub fn get_related_references(
        &self,
        related: ItemId,
    ) -> Result<BTreeMap<ItemId, f64>, StoreError> {
        self.engine.store.referencing(related)
    }

    pub fn get_stats(&self) -> Result<CacheStats> {
        let total_items = self.count_published()?;
        let summary = self.engine.store.summary()?;

        let avg_relations_per_item = if summary.cached_items == 0 {
            0.0
        } else {
            summary.total_relations as f64 / summary.cached_items as f64
        };
        let cache_coverage_pct = if total_items == 0 {
            0.0
        } else {
            (summary.cached_items as f64 / total_items as f64 * 100.0).min(100.0)
        };

        Ok(CacheStats {
            total_items,
            cached_items: summary.cached_items,
            total_relations: summary.total_relations,
            avg_relations_per_item: round2(avg_relations_per_item),
            cache_coverage_pct: round2(cache_coverage_pct),
            avg_score: round2(summary.avg_score()),
        })
    }

    /// Clear the cache when `config` differs from the config the stored
    /// relations were computed with. Returns true when it cleared.
    pub fn sync_config(&self, config: &AlgorithmConfig) -> Result<bool, StoreError> {
        let fingerprint = effective(config).fingerprint();
        let cleared = match self.engine.store.config_fingerprint()? {
            Some(stored) if stored == fingerprint => return Ok(false),
            None if self.engine.store.summary()?.cached_items == 0 => false,
            _ => {
                self.clear_all()?;
                true
            }
        };
        self.engine.store.set_config_fingerprint(fingerprint)?;
        if cleared {
            info!(fingerprint, "config changed, relation cache invalidated");
        }
        Ok(cleared)
    }

    /// Resolve and store `id`, recomputing when the reference or any related
    /// id was cleared while the computation ran. `None` when the reference
    /// is not in the catalog.
    fn compute_and_store(
        &self,
        id: ItemId,
        config: &AlgorithmConfig,
    ) -> Result<Option<CacheState>, StoreError> {
        for attempt in 1..=MAX_COMPUTE_ATTEMPTS {
            let ticket = self.invalidations.begin();
            let relations = match self.resolve(id, config) {
                Resolution::NotFound => return Ok(None),
                Resolution::Relations(relations) => relations,
            };

            // held across the write so a clear lands either before the
            // check or after the rows exist
            let log = self.invalidations.lock();
            if !log.touched_since(ticket.since, relations.keys().copied().chain([id])) {
                let state = self.write(id, &relations);
                drop(log);
                return state.map(Some);
            }
            drop(log);
            debug!(reference = id, attempt, "inputs cleared during computation, recomputing");
        }
        warn!(reference = id, "inputs kept changing, leaving reference uncached");
        self.engine.store.state(id).map(Some)
    }

    /// Primary computation, then the fallback when it fails or finds
    /// nothing. Never errors: the worst case is an empty set.
    fn resolve(&self, id: ItemId, config: &AlgorithmConfig) -> Resolution {
        let started = Instant::now();
        let engine = self.engine.clone();
        let owned = config.clone();
        match self.bounded(format!("related-{id}"), move || engine.primary(id, &owned)) {
            Ok(None) => return Resolution::NotFound,
            Ok(Some(relations)) if !relations.is_empty() => {
                debug!(
                    reference = id,
                    relations = relations.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "computed relations"
                );
                return Resolution::Relations(relations);
            }
            Ok(Some(_)) => debug!(reference = id, "no scored candidates, using fallback"),
            Err(e) => warn!(reference = id, error = %e, "computation failed, using fallback"),
        }

        let engine = self.engine.clone();
        let owned = config.clone();
        match self.bounded(format!("related-{id}"), move || engine.fallback(id, &owned)) {
            Ok(None) => Resolution::NotFound,
            Ok(Some(relations)) => Resolution::Relations(relations),
            Err(e) => {
                warn!(reference = id, error = %e, "fallback failed, caching empty set");
                Resolution::Relations(BTreeMap::new())
            }
        }
    }

    /// Published item count, under the same time bound as a computation.
    pub(crate) fn count_published(&self) -> Result<usize, CatalogError> {
        let catalog = Arc::clone(&self.engine.catalog);
        self.bounded_catalog(move || catalog.count_published())
    }

    /// One listing page, under the same time bound as a computation.
    pub(crate) fn list_published(&self, filter: ItemFilter) -> Result<Vec<Item>, CatalogError> {
        let catalog = Arc::clone(&self.engine.catalog);
        self.bounded_catalog(move || catalog.list_published_items(&filter))
    }

    fn bounded_catalog<T, F>(&self, job: F) -> Result<T, CatalogError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CatalogError> + Send + 'static,
    {
        self.bounded("related-catalog".into(), move || job().map_err(ComputeError::from))
            .map_err(|e| match e {
                ComputeError::Catalog(e) => e,
                ComputeError::Timeout(limit) => {
                    CatalogError::Unavailable(format!("no response within {limit:?}"))
                }
                other => CatalogError::Unavailable(other.to_string()),
            })
    }

    /// Run `job` on a worker thread and give up after `compute_timeout`.
    /// The abandoned worker finishes on its own; its result is dropped.
    fn bounded<T, F>(&self, name: String, job: F) -> Result<T, ComputeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ComputeError> + Send + 'static,
    {
        let Some(timeout) = self.options.compute_timeout else {
            return job();
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                // receiver may be gone after a timeout
                let _ = tx.send(job());
            })
            .map_err(|e| ComputeError::Worker(e.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ComputeError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(ComputeError::Worker("worker panicked".into()))
            }
        }
    }

    fn cached_relations(&self, id: ItemId) -> Result<Arc<Vec<ScoredRelation>>, StoreError> {
        if let Some(rows) = self.read_through.get(id) {
            return Ok(rows);
        }
        let epoch = self.read_through.epoch();
        let rows = Arc::new(self.engine.store.relations(id)?);
        if !rows.is_empty() {
            self.read_through.insert(epoch, id, Arc::clone(&rows));
        }
        Ok(rows)
    }

    #[cfg(test)]
    fn memoized(&self) -> usize {
        self.read_through.len()
    }
}

/// `config` as-is when valid, otherwise with defaults substituted.
fn effective(config: &AlgorithmConfig) -> Cow<'_, AlgorithmConfig> {
    if config.is_valid() {
        Cow::Borrowed(config)
    } else {
        Cow::Owned(config.clone().validated().0)
    }
}
