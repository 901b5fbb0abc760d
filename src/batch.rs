//! Full-catalog cache build.
//!
//! Walks every published item in id order, one page of `batch_size` at a
//! time, and runs the compute-and-store path for each. A failing or
//! panicking item is counted and skipped. A page that cannot be listed
//! stops the run and marks it unsuccessful. Cancellation is checked before
//! each item; nothing is locked across items.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::catalog::ItemFilter;
use crate::config::AlgorithmConfig;
use crate::error::StoreError;
use crate::model::{CacheState, ItemId};

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub batch_size: usize,
    /// Drop the whole cache before building.
    pub clear_first: bool,
    /// Leave already-cached items alone. With `clear_first = false` this
    /// resumes an interrupted build.
    pub skip_cached: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            clear_first: true,
            skip_cached: false,
        }
    }
}

impl BuildOptions {
    pub fn resume(batch_size: usize) -> Self {
        Self {
            batch_size,
            clear_first: false,
            skip_cached: true,
        }
    }
}

/// Shared cancellation flag, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Live counters, safe to poll from another thread while a build runs.
#[derive(Debug, Default)]
pub struct BuildProgress {
    total: AtomicUsize,
    processed: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
    relations: AtomicUsize,
    finished: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total_relations: usize,
    pub percent: f64,
    pub finished: bool,
}

impl BuildProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed);
        let percent = if total == 0 {
            0.0
        } else {
            ((processed as f64 / total as f64) * 10_000.0).round() / 100.0
        };
        ProgressSnapshot {
            total,
            processed,
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_relations: self.relations.load(Ordering::Relaxed),
            percent,
            finished: self.finished.load(Ordering::Relaxed),
        }
    }

    fn reset(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.relations.store(0, Ordering::Relaxed);
        self.finished.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub processed: usize,
    pub total_relations: usize,
    pub errors: usize,
    /// False when the run was cancelled, could not start, or stopped early
    /// because the catalog could not be listed.
    pub success: bool,
    pub cancelled: bool,
    pub message: String,
}

impl BuildReport {
    fn aborted(message: String) -> Self {
        Self {
            processed: 0,
            total_relations: 0,
            errors: 0,
            success: false,
            cancelled: false,
            message,
        }
    }
}

type ProgressCallback<'a> = Box<dyn Fn(&ProgressSnapshot) + Send + Sync + 'a>;

/// Builds or refreshes the relation cache for the whole catalog.
pub struct BatchBuilder<'a> {
    manager: &'a CacheManager,
    config: &'a AlgorithmConfig,
    options: BuildOptions,
    cancel: CancelToken,
    progress: Arc<BuildProgress>,
    on_progress: Option<ProgressCallback<'a>>,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(manager: &'a CacheManager, config: &'a AlgorithmConfig) -> Self {
        Self {
            manager,
            config,
            options: BuildOptions::default(),
            cancel: CancelToken::new(),
            progress: Arc::new(BuildProgress::default()),
            on_progress: None,
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called with a snapshot at every batch boundary and once at the end.
    pub fn on_progress(mut self, callback: impl Fn(&ProgressSnapshot) + Send + Sync + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Handle for polling progress from another thread.
    pub fn progress(&self) -> Arc<BuildProgress> {
        Arc::clone(&self.progress)
    }

    pub fn run(&self) -> BuildReport {
        let batch_size = self.options.batch_size.max(1);

        if let Err(e) = self.prepare() {
            warn!(error = %e, "could not prepare relation cache for build");
            return BuildReport::aborted(format!("Build aborted: {e}"));
        }

        let total = match self.manager.count_published() {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "could not count catalog items");
                return BuildReport::aborted(format!("Build aborted: {e}"));
            }
        };
        self.progress.reset(total);
        info!(total, batch_size, "building relation cache");

        let mut offset = 0;
        let mut cancelled = false;
        let mut stopped = None;
        'pages: loop {
            let page = match self.manager.list_published(ItemFilter::page(offset, batch_size)) {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "could not list catalog page, stopping");
                    self.progress.errors.fetch_add(1, Ordering::Relaxed);
                    stopped = Some(format!("Build stopped at offset {offset}: {e}"));
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for item in &page {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break 'pages;
                }
                self.process(item.id);
            }

            let snapshot = self.progress.snapshot();
            info!(
                processed = snapshot.processed,
                total = snapshot.total,
                errors = snapshot.errors,
                "build progress"
            );
            if let Some(callback) = &self.on_progress {
                callback(&snapshot);
            }
            if page.len() < batch_size {
                break;
            }
        }

        self.progress.finished.store(true, Ordering::Relaxed);
        let snapshot = self.progress.snapshot();
        if let Some(callback) = &self.on_progress {
            callback(&snapshot);
        }

        let message = if cancelled {
            format!(
                "Build cancelled after {} of {} items",
                snapshot.processed, snapshot.total
            )
        } else if let Some(reason) = &stopped {
            format!(
                "{reason} ({} of {} items processed)",
                snapshot.processed, snapshot.total
            )
        } else {
            format!(
                "Processed {} items with {} relations ({} errors)",
                snapshot.processed, snapshot.total_relations, snapshot.errors
            )
        };
        info!(
            processed = snapshot.processed,
            relations = snapshot.total_relations,
            errors = snapshot.errors,
            cancelled,
            stopped = stopped.is_some(),
            "relation cache build finished"
        );

        BuildReport {
            processed: snapshot.processed,
            total_relations: snapshot.total_relations,
            errors: snapshot.errors,
            success: !cancelled && stopped.is_none(),
            cancelled,
            message,
        }
    }

    fn prepare(&self) -> Result<(), StoreError> {
        if self.options.clear_first {
            self.manager.clear_all()?;
        }
        self.manager.sync_config(self.config)?;
        Ok(())
    }

    fn process(&self, id: ItemId) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.build_one(id)));
        match outcome {
            Ok(Ok(Some(state))) => {
                self.progress
                    .relations
                    .fetch_add(state.relation_count(), Ordering::Relaxed);
            }
            Ok(Ok(None)) => {
                self.progress.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!(reference = id, error = %e, "failed to build relations");
                self.progress.errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!(reference = id, "relation build panicked");
                self.progress.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.progress.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// `None` when the item was skipped as already cached.
    fn build_one(&self, id: ItemId) -> Result<Option<CacheState>, StoreError> {
        if self.options.clear_first {
            return self.manager.enforce_cache(id, self.config).map(Some);
        }
        if self.options.skip_cached && self.manager.is_cached(id)? {
            return Ok(None);
        }
        if self.options.skip_cached {
            return self.manager.enforce_cache(id, self.config).map(Some);
        }
        self.manager.rebuild_item(id, self.config).map(Some)
    }
}

/// Clear the cache and rebuild it for every published item.
pub fn build_cache(
    manager: &CacheManager,
    config: &AlgorithmConfig,
    batch_size: usize,
) -> BuildReport {
    BatchBuilder::new(manager, config)
        .with_options(BuildOptions {
            batch_size,
            ..BuildOptions::default()
        })
        .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::similarity::{Scorer, WeightedScorer};
    use crate::cache::ManagerOptions;
    use crate::catalog::{Catalog, InMemoryCatalog};
    use crate::config::TextOptions;
    use crate::error::{CatalogError, ComputeError};
    use crate::model::{Item, TaxonomyKey};
    use crate::store::{MemoryStore, RelationStore};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn items() -> Vec<Item> {
        vec![
            Item::new(1, "Wireless Headphones").with_categories(["audio"]).with_tags(["bluetooth"]),
            Item::new(2, "Wireless Earbuds").with_categories(["audio"]).with_tags(["bluetooth"]),
            Item::new(3, "Studio Monitor Speakers").with_categories(["audio"]),
            Item::new(4, "Garden Hose").with_categories(["garden"]),
            Item::new(5, "Garden Hose Reel").with_categories(["garden"]),
            Item::new(6, "Unreleased Gadget").draft(),
        ]
    }

    fn manager_with(scorer: Arc<dyn Scorer>) -> CacheManager {
        CacheManager::new(
            Arc::new(InMemoryCatalog::from_items(items())),
            Arc::new(MemoryStore::new()),
            scorer,
        )
        .with_options(ManagerOptions {
            compute_timeout: None,
            ..ManagerOptions::default()
        })
    }

    fn manager() -> CacheManager {
        manager_with(Arc::new(WeightedScorer::new()))
    }

    fn snapshot_of(m: &CacheManager) -> BTreeMap<ItemId, Vec<(ItemId, f64)>> {
        (1..=6)
            .map(|id| {
                let rels = m
                    .store_handle()
                    .relations(id)
                    .unwrap()
                    .into_iter()
                    .map(|r| (r.related_id, r.score))
                    .collect();
                (id, rels)
            })
            .collect()
    }

    #[test]
    fn builds_every_published_item() {
        let m = manager();
        let config = AlgorithmConfig::default();
        let report = build_cache(&m, &config, 2);
        assert!(report.success);
        assert_eq!(report.processed, 5);
        assert_eq!(report.errors, 0);
        assert!(report.total_relations > 0);
        for id in 1..=5 {
            assert!(m.is_cached(id).unwrap(), "item {id} not cached");
        }
        assert!(!m.is_cached(6).unwrap());
        assert!(report.message.starts_with("Processed 5 items"));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let m = manager();
        let config = AlgorithmConfig::default();
        let first = build_cache(&m, &config, 3);
        let before = snapshot_of(&m);
        let second = build_cache(&m, &config, 3);
        assert_eq!(first.total_relations, second.total_relations);
        assert_eq!(before, snapshot_of(&m));
    }

    #[test]
    fn rebuild_is_stable_with_fuzzy_matching() {
        let m = manager();
        let config = AlgorithmConfig {
            text: TextOptions {
                fuzzy_matching: true,
                ..TextOptions::default()
            },
            ..AlgorithmConfig::default()
        };
        let scores = |m: &CacheManager| -> BTreeMap<ItemId, BTreeMap<ItemId, f64>> {
            snapshot_of(m)
                .into_iter()
                .map(|(id, rels)| (id, rels.into_iter().collect()))
                .collect()
        };

        build_cache(&m, &config, 3);
        let before = scores(&m);
        build_cache(&m, &config, 3);
        let after = scores(&m);

        assert!(before.values().any(|rels| !rels.is_empty()));
        for (id, rels) in &before {
            let again = &after[id];
            assert_eq!(rels.keys().collect::<Vec<_>>(), again.keys().collect::<Vec<_>>());
            for (related, score) in rels {
                assert!(
                    (score - again[related]).abs() < 1e-9,
                    "score {id}->{related} drifted"
                );
            }
        }
    }

    #[test]
    fn build_clears_stale_rows() {
        let m = manager();
        m.store(1, &BTreeMap::from([(99, 9.0)])).unwrap();
        build_cache(&m, &AlgorithmConfig::default(), 10);
        assert_eq!(m.get_score(1, 99).unwrap(), None);
    }

    #[test]
    fn resume_skips_cached_items() {
        let m = manager();
        let config = AlgorithmConfig::default();
        // record the fingerprint so resuming does not clear
        m.sync_config(&config).unwrap();
        m.store(1, &BTreeMap::from([(99, 9.0)])).unwrap();

        let report = BatchBuilder::new(&m, &config)
            .with_options(BuildOptions::resume(2))
            .run();
        assert_eq!(report.processed, 5);
        assert_eq!(m.get_score(1, 99).unwrap(), Some(9.0));
        assert!(m.is_cached(5).unwrap());
    }

    #[test]
    fn refresh_without_clear_replaces_rows() {
        let m = manager();
        let config = AlgorithmConfig::default();
        m.sync_config(&config).unwrap();
        m.store(1, &BTreeMap::from([(99, 9.0)])).unwrap();

        let report = BatchBuilder::new(&m, &config)
            .with_options(BuildOptions {
                batch_size: 10,
                clear_first: false,
                skip_cached: false,
            })
            .run();
        assert!(report.success);
        assert_eq!(m.get_score(1, 99).unwrap(), None);
    }

    #[test]
    fn cancellation_stops_between_items() {
        let m = manager();
        let config = AlgorithmConfig::default();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();

        let report = BatchBuilder::new(&m, &config)
            .with_options(BuildOptions {
                batch_size: 2,
                ..BuildOptions::default()
            })
            .with_cancel(cancel)
            .on_progress(move |snapshot| {
                if snapshot.processed >= 2 {
                    trigger.cancel();
                }
            })
            .run();

        assert!(report.cancelled);
        assert!(!report.success);
        assert_eq!(report.processed, 2);
        assert!(!m.is_cached(3).unwrap());
    }

    /// In-memory catalog whose listing pages fail or stall from `from_offset` on.
    struct BrokenPages {
        inner: InMemoryCatalog,
        from_offset: usize,
        stall: Option<Duration>,
    }

    impl Catalog for BrokenPages {
        fn get_item(&self, id: ItemId) -> Result<Option<Item>, CatalogError> {
            self.inner.get_item(id)
        }

        fn list_published_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, CatalogError> {
            if filter.limit.is_some() && filter.offset >= self.from_offset {
                match self.stall {
                    Some(delay) => thread::sleep(delay),
                    None => return Err(CatalogError::Unavailable("page lost".into())),
                }
            }
            self.inner.list_published_items(filter)
        }

        fn items_by_taxonomy_term(
            &self,
            taxonomy: &TaxonomyKey,
            terms: &BTreeSet<String>,
            limit: usize,
        ) -> Result<Vec<ItemId>, CatalogError> {
            self.inner.items_by_taxonomy_term(taxonomy, terms, limit)
        }
    }

    fn broken_pages_manager(stall: Option<Duration>, timeout: Option<Duration>) -> CacheManager {
        let catalog = BrokenPages {
            inner: InMemoryCatalog::from_items(items()),
            from_offset: 2,
            stall,
        };
        CacheManager::new(
            Arc::new(catalog),
            Arc::new(MemoryStore::new()),
            Arc::new(WeightedScorer::new()),
        )
        .with_options(ManagerOptions {
            compute_timeout: timeout,
            ..ManagerOptions::default()
        })
    }

    #[test]
    fn failed_page_listing_is_not_success() {
        let m = broken_pages_manager(None, None);
        let report = build_cache(&m, &AlgorithmConfig::default(), 2);

        assert!(!report.success);
        assert!(!report.cancelled);
        assert_eq!(report.processed, 2);
        assert_eq!(report.errors, 1);
        assert!(report.message.contains("offset 2"), "{}", report.message);
        assert!(m.is_cached(2).unwrap());
        assert!(!m.is_cached(3).unwrap());
    }

    #[test]
    fn stalled_page_listing_times_out() {
        let m = broken_pages_manager(
            Some(Duration::from_secs(2)),
            Some(Duration::from_millis(200)),
        );
        let started = Instant::now();
        let report = build_cache(&m, &AlgorithmConfig::default(), 2);

        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(!report.success);
        assert_eq!(report.processed, 2);
        assert!(report.message.contains("no response within"), "{}", report.message);
    }

    /// Panics for one reference, scores 1.0 otherwise.
    struct PanicsOn(ItemId);

    impl Scorer for PanicsOn {
        fn score(&self, reference: &Item, _: &Item, _: &AlgorithmConfig) -> Result<f64, ComputeError> {
            if reference.id == self.0 {
                panic!("scorer blew up on {}", reference.id);
            }
            Ok(2.0)
        }
    }

    #[test]
    fn panicking_item_does_not_abort_run() {
        // rayon re-raises the scorer panic on the calling thread
        let m = manager_with(Arc::new(PanicsOn(3)));
        let report = build_cache(&m, &AlgorithmConfig::default(), 2);
        assert!(report.success);
        assert_eq!(report.processed, 5);
        assert_eq!(report.errors, 1);
        assert!(m.is_cached(4).unwrap());
        assert!(!m.is_cached(3).unwrap());
    }

    #[test]
    fn progress_reported_per_batch() {
        let m = manager();
        let config = AlgorithmConfig::default();
        let seen = Mutex::new(Vec::new());
        let builder = BatchBuilder::new(&m, &config)
            .with_options(BuildOptions {
                batch_size: 2,
                ..BuildOptions::default()
            })
            .on_progress(|snapshot| seen.lock().unwrap().push(snapshot.processed));
        let progress = builder.progress();
        builder.run();

        assert_eq!(*seen.lock().unwrap(), vec![2, 4, 5, 5]);
        let done = progress.snapshot();
        assert!(done.finished);
        assert_eq!(done.total, 5);
        assert_eq!(done.percent, 100.0);
    }
}
