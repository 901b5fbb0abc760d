//! Catalog access: the read-only item repository the engine scores against.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;

use crate::error::{CatalogError, ConfigError};
use crate::model::{Item, ItemId, TaxonomyKey};

/// Ordering of [`Catalog::list_published_items`] results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemOrder {
    #[default]
    IdAscending,
    /// Most recently published first, ties broken by id descending.
    NewestFirst,
}

/// Paging and exclusion for item listings.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub order: ItemOrder,
    pub offset: usize,
    pub limit: Option<usize>,
    pub exclude: BTreeSet<ItemId>,
}

impl ItemFilter {
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn newest(limit: usize) -> Self {
        Self {
            order: ItemOrder::NewestFirst,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn excluding(mut self, id: ItemId) -> Self {
        self.exclude.insert(id);
        self
    }
}

/// Item repository consumed by the engine. Only published items are ever
/// returned by the listing and taxonomy queries.
pub trait Catalog: Send + Sync {
    fn get_item(&self, id: ItemId) -> Result<Option<Item>, CatalogError>;

    fn list_published_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, CatalogError>;

    /// Published items carrying at least one of `terms` in `taxonomy`, newest
    /// first, at most `limit`.
    fn items_by_taxonomy_term(
        &self,
        taxonomy: &TaxonomyKey,
        terms: &BTreeSet<String>,
        limit: usize,
    ) -> Result<Vec<ItemId>, CatalogError>;

    fn count_published(&self) -> Result<usize, CatalogError> {
        Ok(self.list_published_items(&ItemFilter::default())?.len())
    }

    /// Fetch several items, skipping ids that no longer exist.
    fn get_items(&self, ids: &[ItemId]) -> Result<Vec<Item>, CatalogError> {
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(item) = self.get_item(id)? {
                items.push(item);
            }
        }
        Ok(items)
    }
}

/// Catalog held in memory, loadable from a JSON array of items.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    items: RwLock<BTreeMap<ItemId, Item>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Self {
        let map = items.into_iter().map(|item| (item.id, item)).collect();
        Self {
            items: RwLock::new(map),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let items: Vec<Item> = serde_json::from_str(json)?;
        Ok(Self::from_items(items))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Insert or replace an item.
    pub fn upsert(&self, item: Item) -> Result<(), CatalogError> {
        self.write()?.insert(item.id, item);
        Ok(())
    }

    pub fn remove(&self, id: ItemId) -> Result<Option<Item>, CatalogError> {
        Ok(self.write()?.remove(&id))
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<ItemId, Item>>, CatalogError> {
        self.items
            .read()
            .map_err(|_| CatalogError::Unavailable("catalog lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<ItemId, Item>>, CatalogError> {
        self.items
            .write()
            .map_err(|_| CatalogError::Unavailable("catalog lock poisoned".into()))
    }
}

fn newest_first(a: &Item, b: &Item) -> std::cmp::Ordering {
    b.published_at
        .cmp(&a.published_at)
        .then_with(|| b.id.cmp(&a.id))
}

impl Catalog for InMemoryCatalog {
    fn get_item(&self, id: ItemId) -> Result<Option<Item>, CatalogError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn list_published_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, CatalogError> {
        let items = self.read()?;
        let mut published: Vec<&Item> = items
            .values()
            .filter(|item| item.is_published() && !filter.exclude.contains(&item.id))
            .collect();
        if filter.order == ItemOrder::NewestFirst {
            published.sort_by(|a, b| newest_first(a, b));
        }
        Ok(published
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn items_by_taxonomy_term(
        &self,
        taxonomy: &TaxonomyKey,
        terms: &BTreeSet<String>,
        limit: usize,
    ) -> Result<Vec<ItemId>, CatalogError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let items = self.read()?;
        let mut matching: Vec<&Item> = items
            .values()
            .filter(|item| item.is_published())
            .filter(|item| !item.terms(taxonomy).is_disjoint(terms))
            .collect();
        matching.sort_by(|a, b| newest_first(a, b));
        Ok(matching.into_iter().take(limit).map(|item| item.id).collect())
    }

    fn count_published(&self) -> Result<usize, CatalogError> {
        Ok(self.read()?.values().filter(|i| i.is_published()).count())
    }
}
