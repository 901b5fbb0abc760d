use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{RelationStore, StoreSummary};
use crate::error::StoreError;
use crate::model::{sort_relations, CacheState, ItemId, ScoredRelation, EMPTY_MARKER};

#[derive(Debug, Default)]
struct Inner {
    /// Sorted relation rows per reference. An empty vec is the marker.
    rows: HashMap<ItemId, Vec<ScoredRelation>>,
    fingerprint: Option<u64>,
}

/// In-process relation store. Each reference's row set is swapped as a
/// whole under the write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

fn normalize(reference: ItemId, relations: &[ScoredRelation]) -> Vec<ScoredRelation> {
    let mut by_id: BTreeMap<ItemId, ScoredRelation> = BTreeMap::new();
    for rel in relations {
        if rel.related_id == EMPTY_MARKER {
            continue;
        }
        by_id.insert(
            rel.related_id,
            ScoredRelation {
                reference_id: reference,
                ..rel.clone()
            },
        );
    }
    let mut rows: Vec<ScoredRelation> = by_id.into_values().collect();
    sort_relations(&mut rows);
    rows
}

impl RelationStore for MemoryStore {
    fn replace(&self, reference: ItemId, relations: &[ScoredRelation]) -> Result<(), StoreError> {
        let rows = normalize(reference, relations);
        self.write()?.rows.insert(reference, rows);
        Ok(())
    }

    fn ensure_marker(&self, reference: ItemId) -> Result<(), StoreError> {
        self.write()?.rows.entry(reference).or_default();
        Ok(())
    }

    fn state(&self, reference: ItemId) -> Result<CacheState, StoreError> {
        Ok(match self.read()?.rows.get(&reference) {
            None => CacheState::Absent,
            Some(rows) if rows.is_empty() => CacheState::Empty,
            Some(rows) => CacheState::Populated(rows.len()),
        })
    }

    fn relations(&self, reference: ItemId) -> Result<Vec<ScoredRelation>, StoreError> {
        Ok(self
            .read()?
            .rows
            .get(&reference)
            .cloned()
            .unwrap_or_default())
    }

    fn related(
        &self,
        reference: ItemId,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredRelation>, StoreError> {
        let inner = self.read()?;
        let Some(rows) = inner.rows.get(&reference) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|r| r.score >= threshold)
            .take(limit)
            .cloned()
            .collect())
    }

    fn score(&self, reference: ItemId, related: ItemId) -> Result<Option<f64>, StoreError> {
        Ok(self.read()?.rows.get(&reference).and_then(|rows| {
            rows.iter()
                .find(|r| r.related_id == related)
                .map(|r| r.score)
        }))
    }

    fn referencing(&self, related: ItemId) -> Result<BTreeMap<ItemId, f64>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .iter()
            .filter_map(|(&reference, rows)| {
                rows.iter()
                    .find(|r| r.related_id == related)
                    .map(|r| (reference, r.score))
            })
            .collect())
    }

    fn remove(&self, ids: &BTreeSet<ItemId>) -> Result<usize, StoreError> {
        let mut inner = self.write()?;
        let mut removed = 0;
        for id in ids {
            if let Some(rows) = inner.rows.remove(id) {
                removed += rows.len().max(1);
            }
        }
        inner.rows.retain(|_, rows| {
            if rows.is_empty() {
                return true;
            }
            let before = rows.len();
            rows.retain(|r| !ids.contains(&r.related_id));
            removed += before - rows.len();
            !rows.is_empty()
        });
        Ok(removed)
    }

    fn truncate(&self) -> Result<usize, StoreError> {
        let mut inner = self.write()?;
        let removed = inner.rows.values().map(|rows| rows.len().max(1)).sum();
        inner.rows.clear();
        Ok(removed)
    }

    fn summary(&self) -> Result<StoreSummary, StoreError> {
        let inner = self.read()?;
        let mut summary = StoreSummary {
            cached_items: inner.rows.len(),
            ..StoreSummary::default()
        };
        for rows in inner.rows.values() {
            summary.total_relations += rows.len();
            summary.score_sum += rows.iter().map(|r| r.score).sum::<f64>();
        }
        Ok(summary)
    }

    fn config_fingerprint(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.read()?.fingerprint)
    }

    fn set_config_fingerprint(&self, fingerprint: u64) -> Result<(), StoreError> {
        self.write()?.fingerprint = Some(fingerprint);
        Ok(())
    }
}
