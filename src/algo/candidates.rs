//! Bounded candidate selection for a reference item.
//!
//! Pools are drawn in order (shared categories, shared tags, then recent
//! items as a top-up) until the cap is reached. An item with no taxonomy
//! still gets candidates from the recency pool.

use std::collections::HashSet;

use tracing::debug;

use crate::catalog::{Catalog, ItemFilter};
use crate::config::AlgorithmConfig;
use crate::error::CatalogError;
use crate::model::{Item, ItemId, TaxonomyKey};

/// Pool sizes used while gathering candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateLimits {
    pub max_candidates: usize,
    pub category_pool: usize,
    pub tag_pool: usize,
    /// Recent items are appended only when fewer candidates than this were found.
    pub recent_when_below: usize,
    pub recent_pool: usize,
}

impl Default for CandidateLimits {
    fn default() -> Self {
        Self {
            max_candidates: 50,
            category_pool: 100,
            tag_pool: 50,
            recent_when_below: 20,
            recent_pool: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateSelector {
    limits: CandidateLimits,
}

impl CandidateSelector {
    pub fn new(limits: CandidateLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &CandidateLimits {
        &self.limits
    }

    /// Deduplicated candidate ids in pool order, never including the
    /// reference, at most `max_candidates`.
    pub fn candidate_ids(
        &self,
        reference: &Item,
        catalog: &dyn Catalog,
    ) -> Result<Vec<ItemId>, CatalogError> {
        let mut seen: HashSet<ItemId> = HashSet::from([reference.id]);
        let mut ids = Vec::new();
        let mut push = |id: ItemId, ids: &mut Vec<ItemId>| {
            if seen.insert(id) {
                ids.push(id);
            }
        };

        if !reference.categories.is_empty() {
            for id in catalog.items_by_taxonomy_term(
                &TaxonomyKey::Category,
                &reference.categories,
                self.limits.category_pool,
            )? {
                push(id, &mut ids);
            }
        }

        if ids.len() < self.limits.max_candidates && !reference.tags.is_empty() {
            for id in catalog.items_by_taxonomy_term(
                &TaxonomyKey::Tag,
                &reference.tags,
                self.limits.tag_pool,
            )? {
                push(id, &mut ids);
            }
        }

        if ids.len() < self.limits.recent_when_below {
            let filter = ItemFilter::newest(self.limits.recent_pool).excluding(reference.id);
            for item in catalog.list_published_items(&filter)? {
                push(item.id, &mut ids);
            }
        }

        ids.truncate(self.limits.max_candidates);
        Ok(ids)
    }

    /// Load candidate items and drop those failing the required-taxonomy
    /// filter. Rejected candidates are never scored.
    pub fn select(
        &self,
        reference: &Item,
        catalog: &dyn Catalog,
        config: &AlgorithmConfig,
    ) -> Result<Vec<Item>, CatalogError> {
        let ids = self.candidate_ids(reference, catalog)?;
        let gathered = ids.len();
        let items: Vec<Item> = catalog
            .get_items(&ids)?
            .into_iter()
            .filter(|c| c.is_published() && c.id != reference.id)
            .filter(|c| meets_required_taxonomies(reference, c, config))
            .collect();
        debug!(
            reference = reference.id,
            gathered,
            kept = items.len(),
            "candidates selected"
        );
        Ok(items)
    }
}

/// True when no taxonomy is required, or the candidate shares at least the
/// configured number of terms with the reference in at least one of them.
pub fn meets_required_taxonomies(
    reference: &Item,
    candidate: &Item,
    config: &AlgorithmConfig,
) -> bool {
    if config.required_taxonomies.is_empty() {
        return true;
    }
    config.required_taxonomies.iter().any(|(taxonomy, &min)| {
        let shared = reference
            .terms(taxonomy)
            .intersection(&candidate.terms(taxonomy))
            .count();
        shared >= min
    })
}
