//! Persistent relation storage.
//!
//! A store holds at most one row per `(reference_id, related_id)` pair. A
//! reference whose relation set is computed but empty is represented by a
//! single marker row with `related_id == EMPTY_MARKER`; marker rows are never
//! returned by relation queries.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::StoreError;
use crate::model::{CacheState, ItemId, ScoredRelation};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    /// References with any row, marker rows included.
    pub cached_items: usize,
    /// Real relation rows, marker rows excluded.
    pub total_relations: usize,
    pub score_sum: f64,
}

impl StoreSummary {
    pub fn avg_score(&self) -> f64 {
        if self.total_relations == 0 {
            0.0
        } else {
            self.score_sum / self.total_relations as f64
        }
    }
}

/// Relation table keyed by `(reference_id, related_id)`.
///
/// `replace` must be atomic from a reader's point of view: readers see the
/// old set or the new set, never a mix.
pub trait RelationStore: Send + Sync {
    /// Replace every row of `reference`. An empty slice writes the marker.
    fn replace(&self, reference: ItemId, relations: &[ScoredRelation]) -> Result<(), StoreError>;

    /// Make sure `reference` has at least the marker row, leaving existing
    /// rows alone.
    fn ensure_marker(&self, reference: ItemId) -> Result<(), StoreError>;

    fn state(&self, reference: ItemId) -> Result<CacheState, StoreError>;

    /// Every relation of `reference`, score descending then related id descending.
    fn relations(&self, reference: ItemId) -> Result<Vec<ScoredRelation>, StoreError>;

    /// Relations with `score >= threshold`, same order, at most `limit`.
    fn related(
        &self,
        reference: ItemId,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredRelation>, StoreError>;

    fn score(&self, reference: ItemId, related: ItemId) -> Result<Option<f64>, StoreError>;

    /// References that currently list `related`, with their scores.
    fn referencing(&self, related: ItemId) -> Result<BTreeMap<ItemId, f64>, StoreError>;

    /// Delete every row where any of `ids` is the reference or the related
    /// side. Returns the number of rows deleted.
    fn remove(&self, ids: &BTreeSet<ItemId>) -> Result<usize, StoreError>;

    /// Delete every row. Returns the number of rows deleted.
    fn truncate(&self) -> Result<usize, StoreError>;

    fn summary(&self) -> Result<StoreSummary, StoreError>;

    /// Fingerprint of the config the stored relations were computed with.
    fn config_fingerprint(&self) -> Result<Option<u64>, StoreError>;

    fn set_config_fingerprint(&self, fingerprint: u64) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every store must share; run against each backend.

    use super::*;
    use crate::model::EMPTY_MARKER;

    pub fn rel(reference: ItemId, related: ItemId, score: f64) -> ScoredRelation {
        ScoredRelation {
            reference_id: reference,
            related_id: related,
            score,
            computed_at: 1_700_000_000,
        }
    }

    fn ids(rels: &[ScoredRelation]) -> Vec<ItemId> {
        rels.iter().map(|r| r.related_id).collect()
    }

    pub fn replace_then_read(store: &dyn RelationStore) {
        assert_eq!(store.state(1).unwrap(), CacheState::Absent);
        store
            .replace(1, &[rel(1, 2, 3.0), rel(1, 3, 5.0), rel(1, 4, 1.0)])
            .unwrap();
        assert_eq!(store.state(1).unwrap(), CacheState::Populated(3));
        assert_eq!(ids(&store.relations(1).unwrap()), vec![3, 2, 4]);
        assert_eq!(ids(&store.related(1, 2.0, 10).unwrap()), vec![3, 2]);
        assert_eq!(ids(&store.related(1, 0.0, 2).unwrap()), vec![3, 2]);
        assert_eq!(store.score(1, 3).unwrap(), Some(5.0));
        assert_eq!(store.score(1, 9).unwrap(), None);
    }

    pub fn replace_swaps_whole_set(store: &dyn RelationStore) {
        store.replace(1, &[rel(1, 2, 3.0), rel(1, 3, 5.0)]).unwrap();
        store.replace(1, &[rel(1, 4, 2.0)]).unwrap();
        assert_eq!(ids(&store.relations(1).unwrap()), vec![4]);
        assert_eq!(store.state(1).unwrap(), CacheState::Populated(1));
    }

    pub fn duplicate_pairs_collapse(store: &dyn RelationStore) {
        store.replace(1, &[rel(1, 2, 3.0), rel(1, 2, 4.0)]).unwrap();
        let rels = store.relations(1).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].score, 4.0);
    }

    pub fn ties_order_by_id_descending(store: &dyn RelationStore) {
        store
            .replace(1, &[rel(1, 2, 1.0), rel(1, 7, 1.0), rel(1, 5, 1.0)])
            .unwrap();
        assert_eq!(ids(&store.relations(1).unwrap()), vec![7, 5, 2]);
    }

    pub fn empty_replace_writes_marker(store: &dyn RelationStore) {
        store.replace(1, &[]).unwrap();
        assert_eq!(store.state(1).unwrap(), CacheState::Empty);
        assert!(store.relations(1).unwrap().is_empty());
        assert_eq!(store.score(1, EMPTY_MARKER).unwrap(), None);
        let summary = store.summary().unwrap();
        assert_eq!(summary.cached_items, 1);
        assert_eq!(summary.total_relations, 0);
    }

    pub fn ensure_marker_keeps_rows(store: &dyn RelationStore) {
        store.ensure_marker(1).unwrap();
        assert_eq!(store.state(1).unwrap(), CacheState::Empty);
        store.replace(2, &[rel(2, 3, 1.0)]).unwrap();
        store.ensure_marker(2).unwrap();
        assert_eq!(store.state(2).unwrap(), CacheState::Populated(1));
    }

    pub fn remove_clears_both_sides(store: &dyn RelationStore) {
        store.replace(1, &[rel(1, 2, 3.0), rel(1, 3, 2.0)]).unwrap();
        store.replace(2, &[rel(2, 1, 3.0)]).unwrap();
        store.replace(3, &[rel(3, 2, 1.0)]).unwrap();
        store.replace(4, &[rel(4, 5, 1.0)]).unwrap();

        let referencing = store.referencing(2).unwrap();
        assert_eq!(referencing.keys().copied().collect::<Vec<_>>(), vec![1, 3]);

        let removed = store.remove(&BTreeSet::from([2])).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.state(2).unwrap(), CacheState::Absent);
        assert_eq!(ids(&store.relations(1).unwrap()), vec![3]);
        // 3 only pointed at 2, so it no longer has any row
        assert_eq!(store.state(3).unwrap(), CacheState::Absent);
        assert_eq!(store.state(4).unwrap(), CacheState::Populated(1));
    }

    pub fn truncate_drops_everything(store: &dyn RelationStore) {
        store.replace(1, &[rel(1, 2, 3.0)]).unwrap();
        store.replace(5, &[]).unwrap();
        assert_eq!(store.truncate().unwrap(), 2);
        assert_eq!(store.summary().unwrap(), StoreSummary::default());
        assert_eq!(store.state(5).unwrap(), CacheState::Absent);
    }

    pub fn summary_aggregates(store: &dyn RelationStore) {
        store.replace(1, &[rel(1, 2, 3.0), rel(1, 3, 1.0)]).unwrap();
        store.replace(2, &[rel(2, 1, 2.0)]).unwrap();
        store.replace(3, &[]).unwrap();
        let summary = store.summary().unwrap();
        assert_eq!(summary.cached_items, 3);
        assert_eq!(summary.total_relations, 3);
        assert!((summary.avg_score() - 2.0).abs() < 1e-12);
    }

    pub fn fingerprint_roundtrip(store: &dyn RelationStore) {
        assert_eq!(store.config_fingerprint().unwrap(), None);
        store.set_config_fingerprint(u64::MAX - 7).unwrap();
        assert_eq!(store.config_fingerprint().unwrap(), Some(u64::MAX - 7));
        store.set_config_fingerprint(42).unwrap();
        assert_eq!(store.config_fingerprint().unwrap(), Some(42));
    }

    pub fn all(make: impl Fn() -> Box<dyn RelationStore>) {
        replace_then_read(make().as_ref());
        replace_swaps_whole_set(make().as_ref());
        duplicate_pairs_collapse(make().as_ref());
        ties_order_by_id_descending(make().as_ref());
        empty_replace_writes_marker(make().as_ref());
        ensure_marker_keeps_rows(make().as_ref());
        remove_clears_both_sides(make().as_ref());
        truncate_drops_everything(make().as_ref());
        summary_aggregates(make().as_ref());
        fingerprint_roundtrip(make().as_ref());
    }
}
