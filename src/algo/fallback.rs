//! Degraded relation source used when scoring fails or finds nothing.
//!
//! Tries same-category items, then same-tag items, then any published
//! items, and gives every hit the same flat score.

use std::collections::BTreeSet;

use crate::catalog::{Catalog, ItemFilter};
use crate::config::AlgorithmConfig;
use crate::error::CatalogError;
use crate::model::{Item, ItemId, TaxonomyKey};

use super::candidates::meets_required_taxonomies;

pub const DEFAULT_FALLBACK_SCORE: f64 = 1.0;
pub const DEFAULT_FALLBACK_LIMIT: usize = 10;

/// Which tier produced the fallback relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    Category,
    Tag,
    AnyPublished,
    Nothing,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackStrategy {
    pub limit: usize,
    /// Flat score; `None` uses the config threshold (or the default when the
    /// threshold is zero) so fallback relations survive read filtering.
    pub score: Option<f64>,
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_FALLBACK_LIMIT,
            score: None,
        }
    }
}

impl FallbackStrategy {
    pub fn flat_score(&self, config: &AlgorithmConfig) -> f64 {
        match self.score {
            Some(score) => score,
            None if config.threshold > 0.0 => config.threshold,
            None => DEFAULT_FALLBACK_SCORE,
        }
    }

    /// Relations for `reference` from the first tier that yields anything.
    pub fn relations(
        &self,
        reference: &Item,
        catalog: &dyn Catalog,
        config: &AlgorithmConfig,
    ) -> Result<(FallbackTier, Vec<(ItemId, f64)>), CatalogError> {
        let score = self.flat_score(config);
        let tiers = [
            (FallbackTier::Category, &reference.categories, TaxonomyKey::Category),
            (FallbackTier::Tag, &reference.tags, TaxonomyKey::Tag),
        ];

        for (tier, terms, taxonomy) in tiers {
            if terms.is_empty() {
                continue;
            }
            // over-fetch so the reference and filtered items do not starve the tier
            let ids = catalog.items_by_taxonomy_term(&taxonomy, terms, self.limit + 1)?;
            let ids = self.admissible(reference, catalog, config, ids)?;
            if !ids.is_empty() {
                return Ok((tier, ids.into_iter().map(|id| (id, score)).collect()));
            }
        }

        let filter = ItemFilter::newest(self.limit).excluding(reference.id);
        let ids: Vec<ItemId> = catalog
            .list_published_items(&filter)?
            .into_iter()
            .filter(|c| meets_required_taxonomies(reference, c, config))
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return Ok((FallbackTier::Nothing, Vec::new()));
        }
        Ok((
            FallbackTier::AnyPublished,
            ids.into_iter().map(|id| (id, score)).collect(),
        ))
    }

    fn admissible(
        &self,
        reference: &Item,
        catalog: &dyn Catalog,
        config: &AlgorithmConfig,
        ids: Vec<ItemId>,
    ) -> Result<Vec<ItemId>, CatalogError> {
        let mut seen = BTreeSet::new();
        let ids: Vec<ItemId> = ids
            .into_iter()
            .filter(|&id| id != reference.id && seen.insert(id))
            .collect();
        let admitted = if config.required_taxonomies.is_empty() {
            ids
        } else {
            catalog
                .get_items(&ids)?
                .into_iter()
                .filter(|c| meets_required_taxonomies(reference, c, config))
                .map(|c| c.id)
                .collect()
        };
        Ok(admitted.into_iter().take(self.limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;

    fn reference(catalog: &InMemoryCatalog, id: ItemId) -> Item {
        catalog.get_item(id).unwrap().unwrap()
    }

    #[test]
    fn prefers_same_category() {
        let catalog = InMemoryCatalog::from_items([
            Item::new(1, "r").with_categories(["A"]).with_tags(["t"]),
            Item::new(2, "cat").with_categories(["A"]),
            Item::new(3, "tag").with_tags(["t"]),
        ]);
        let (tier, rels) = FallbackStrategy::default()
            .relations(&reference(&catalog, 1), &catalog, &AlgorithmConfig::default())
            .unwrap();
        assert_eq!(tier, FallbackTier::Category);
        assert_eq!(rels, vec![(2, 1.5)]);
    }

    #[test]
    fn falls_through_to_tags() {
        let catalog = InMemoryCatalog::from_items([
            Item::new(1, "r").with_categories(["Lonely"]).with_tags(["t"]),
            Item::new(3, "tag").with_tags(["t"]),
        ]);
        let (tier, rels) = FallbackStrategy::default()
            .relations(&reference(&catalog, 1), &catalog, &AlgorithmConfig::default())
            .unwrap();
        assert_eq!(tier, FallbackTier::Tag);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].0, 3);
    }

    #[test]
    fn falls_through_to_any_published() {
        let catalog = InMemoryCatalog::from_items([
            Item::new(1, "r"),
            Item::new(2, "x").published_at(1),
            Item::new(3, "y").published_at(2),
            Item::new(4, "draft").draft(),
        ]);
        let strategy = FallbackStrategy {
            limit: 5,
            score: Some(0.25),
        };
        let (tier, rels) = strategy
            .relations(&reference(&catalog, 1), &catalog, &AlgorithmConfig::default())
            .unwrap();
        assert_eq!(tier, FallbackTier::AnyPublished);
        assert_eq!(rels, vec![(3, 0.25), (2, 0.25)]);
    }

    #[test]
    fn single_item_catalog_yields_nothing() {
        let catalog = InMemoryCatalog::from_items([Item::new(1, "alone")]);
        let (tier, rels) = FallbackStrategy::default()
            .relations(&reference(&catalog, 1), &catalog, &AlgorithmConfig::default())
            .unwrap();
        assert_eq!(tier, FallbackTier::Nothing);
        assert!(rels.is_empty());
    }

    #[test]
    fn honors_required_taxonomies() {
        let catalog = InMemoryCatalog::from_items([
            Item::new(1, "r").with_categories(["A"]),
            Item::new(2, "other").with_categories(["B"]),
        ]);
        let config = AlgorithmConfig::default().require(TaxonomyKey::Category, 1);
        let (tier, rels) = FallbackStrategy::default()
            .relations(&reference(&catalog, 1), &catalog, &config)
            .unwrap();
        assert_eq!(tier, FallbackTier::Nothing);
        assert!(rels.is_empty());
    }

    #[test]
    fn flat_score_follows_threshold() {
        let strategy = FallbackStrategy::default();
        assert_eq!(strategy.flat_score(&AlgorithmConfig::default().with_threshold(2.5)), 2.5);
        assert_eq!(
            strategy.flat_score(&AlgorithmConfig::default().with_threshold(0.0)),
            DEFAULT_FALLBACK_SCORE
        );
    }

    #[test]
    fn respects_limit() {
        let catalog = InMemoryCatalog::from_items(
            (1..=30).map(|i| Item::new(i, "x").with_categories(["A"])),
        );
        let strategy = FallbackStrategy {
            limit: 4,
            score: None,
        };
        let (_, rels) = strategy
            .relations(&reference(&catalog, 1), &catalog, &AlgorithmConfig::default())
            .unwrap();
        assert_eq!(rels.len(), 4);
        assert!(rels.iter().all(|(id, _)| *id != 1));
    }
}
