//! Core data types shared by the scorer, the stores and the cache manager.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

/// Catalog item identifier.
pub type ItemId = u64;

/// Related-id value of the row that marks a reference as computed-but-empty.
/// Never a valid catalog id.
pub const EMPTY_MARKER: ItemId = 0;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Publication status of a catalog item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Publish,
    Draft,
}

/// Read-only view of a catalog product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub price: Option<f64>,
    /// Unix seconds.
    #[serde(default)]
    pub published_at: i64,
    #[serde(default)]
    pub sales: u64,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Keyed by normalized attribute name, see [`attribute_name`].
    #[serde(default, deserialize_with = "deserialize_attributes")]
    pub attributes: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl Item {
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name: String = name.into();
        self.attributes
            .entry(attribute_name(&name))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_sales(mut self, sales: u64) -> Self {
        self.sales = sales;
        self
    }

    pub fn published_at(mut self, unix_secs: i64) -> Self {
        self.published_at = unix_secs;
        self
    }

    pub fn draft(mut self) -> Self {
        self.status = ItemStatus::Draft;
        self
    }

    pub fn is_published(&self) -> bool {
        self.status == ItemStatus::Publish
    }

    /// Body text used for content similarity: content, falling back to the
    /// excerpt when the body is blank.
    pub fn body_text(&self) -> &str {
        if self.content.trim().is_empty() {
            &self.excerpt
        } else {
            &self.content
        }
    }

    /// Terms this item carries in the given taxonomy.
    pub fn terms(&self, key: &TaxonomyKey) -> BTreeSet<String> {
        match key {
            TaxonomyKey::Category => self.categories.clone(),
            TaxonomyKey::Tag => self.tags.clone(),
            TaxonomyKey::Attribute(name) => self
                .attributes
                .iter()
                .filter(|(raw, _)| attribute_name(raw) == *name)
                .flat_map(|(_, values)| values.iter().cloned())
                .collect(),
        }
    }
}

/// Canonical attribute name: trimmed, lowercased, `pa_` prefix stripped.
pub fn attribute_name(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match lower.strip_prefix("pa_") {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

fn deserialize_attributes<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, BTreeSet<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, BTreeSet<String>>::deserialize(deserializer)?;
    let mut attributes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, values) in raw {
        attributes.entry(attribute_name(&name)).or_default().extend(values);
    }
    Ok(attributes)
}

/// A taxonomy an item can be classified under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TaxonomyKey {
    Category,
    Tag,
    Attribute(String),
}

impl TaxonomyKey {
    /// Parse a taxonomy name. Anything other than the category/tag aliases
    /// names an attribute; a `pa_` prefix is stripped.
    pub fn parse(s: &str) -> Self {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "category" | "categories" | "product_cat" => Self::Category,
            "tag" | "tags" | "product_tag" => Self::Tag,
            _ => Self::Attribute(attribute_name(&lower)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Category => "category",
            Self::Tag => "tag",
            Self::Attribute(name) => name,
        }
    }
}

impl From<String> for TaxonomyKey {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<TaxonomyKey> for String {
    fn from(value: TaxonomyKey) -> Self {
        value.as_str().to_string()
    }
}

/// One stored (reference, related, score) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRelation {
    pub reference_id: ItemId,
    pub related_id: ItemId,
    pub score: f64,
    /// Unix seconds.
    pub computed_at: u64,
}

/// Cache state of one reference item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "relations", rename_all = "lowercase")]
pub enum CacheState {
    Absent,
    Empty,
    Populated(usize),
}

impl CacheState {
    pub fn is_cached(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    pub fn relation_count(&self) -> usize {
        match self {
            Self::Populated(n) => *n,
            _ => 0,
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Order relations by score descending, then related id descending.
pub fn sort_relations(relations: &mut [ScoredRelation]) {
    relations.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.related_id.cmp(&a.related_id))
    });
}
