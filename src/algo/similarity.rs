//! Weighted multi-signal similarity between two catalog items.
//!
//! Each factor yields a similarity in `0.0..=1.0` and contributes
//! `similarity * weight` when its weight is positive. The sum is then
//! scaled by the enabled boosts, in a fixed order: temporal, popularity,
//! category.

use std::collections::BTreeSet;

use serde::Serialize;

use super::string_distance;
use super::tokenizer;
use crate::config::{AlgorithmConfig, Factor, TextOptions};
use crate::error::ComputeError;
use crate::model::{Item, SECONDS_PER_DAY};

pub const TEMPORAL_WINDOW_DAYS: i64 = 30;
pub const TEMPORAL_BOOST: f64 = 1.1;
pub const POPULARITY_RATIO_CAP: f64 = 2.0;
pub const POPULARITY_STEP: f64 = 0.1;
pub const CATEGORY_BOOST: f64 = 1.2;

/// Computes a non-negative relatedness score for a candidate against a
/// reference item. Implementations must be thread-safe so candidates can be
/// scored in parallel.
pub trait Scorer: Send + Sync {
    fn score(
        &self,
        reference: &Item,
        candidate: &Item,
        config: &AlgorithmConfig,
    ) -> Result<f64, ComputeError>;
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`; 0.0 when either set is empty.
pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

/// Text similarity of two raw strings under the given analysis options.
pub fn text_similarity(a: &str, b: &str, options: &TextOptions) -> f64 {
    let ta = tokenizer::tokenize(a, options);
    let tb = tokenizer::tokenize(b, options);
    token_similarity(&ta, &tb, options.fuzzy_matching)
}

/// Jaccard over token sets, averaged with the fuzzy overlap when enabled.
pub fn token_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>, fuzzy: bool) -> f64 {
    let exact = jaccard(a, b);
    if fuzzy {
        (exact + string_distance::fuzzy_overlap(a, b)) / 2.0
    } else {
        exact
    }
}

/// Mean per-attribute Jaccard over attribute names present on both items.
pub fn attribute_similarity(reference: &Item, candidate: &Item) -> f64 {
    let mut total = 0.0;
    let mut common = 0usize;
    for (name, values) in &reference.attributes {
        if let Some(other) = candidate.attributes.get(name) {
            total += jaccard(values, other);
            common += 1;
        }
    }
    if common == 0 {
        0.0
    } else {
        total / common as f64
    }
}

pub fn brand_similarity(reference: &Item, candidate: &Item) -> f64 {
    match (normalized_brand(reference), normalized_brand(candidate)) {
        (Some(a), Some(b)) if a == b => 1.0,
        _ => 0.0,
    }
}

fn normalized_brand(item: &Item) -> Option<&str> {
    item.brand
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
}

/// Price closeness bucketed by relative difference to the mean price.
pub fn price_similarity(reference: Option<f64>, candidate: Option<f64>) -> f64 {
    let (Some(p1), Some(p2)) = (usable_price(reference), usable_price(candidate)) else {
        return 0.0;
    };
    let avg = (p1 + p2) / 2.0;
    if avg == 0.0 {
        return 1.0;
    }
    let ratio = (p1 - p2).abs() / avg;
    if ratio <= 0.2 {
        1.0
    } else if ratio <= 0.5 {
        0.5
    } else {
        0.1
    }
}

fn usable_price(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p >= 0.0)
}

/// Per-factor contribution to a score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorScore {
    pub factor: Factor,
    pub similarity: f64,
    pub weight: f64,
    pub contribution: f64,
}

/// A multiplicative boost that was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedBoost {
    pub name: &'static str,
    pub multiplier: f64,
}

/// Full explanation of one score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub factors: Vec<FactorScore>,
    pub raw: f64,
    pub boosts: Vec<AppliedBoost>,
    pub total: f64,
}

/// The default scorer: weighted text, taxonomy, price and brand signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedScorer;

impl WeightedScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score with a per-factor breakdown.
    pub fn explain(
        &self,
        reference: &Item,
        candidate: &Item,
        config: &AlgorithmConfig,
    ) -> ScoreBreakdown {
        let mut factors = Vec::new();
        for factor in Factor::ALL {
            let weight = config.weights.get(factor);
            if weight <= 0.0 {
                continue;
            }
            let similarity = factor_similarity(factor, reference, candidate, &config.text);
            factors.push(FactorScore {
                factor,
                similarity,
                weight,
                contribution: similarity * weight,
            });
        }
        let raw: f64 = factors.iter().map(|f| f.contribution).sum();

        let boosts = boosts_for(reference, candidate, config);
        let total = boosts.iter().fold(raw, |acc, b| acc * b.multiplier);

        ScoreBreakdown {
            factors,
            raw,
            boosts,
            total,
        }
    }
}

impl Scorer for WeightedScorer {
    fn score(
        &self,
        reference: &Item,
        candidate: &Item,
        config: &AlgorithmConfig,
    ) -> Result<f64, ComputeError> {
        Ok(self.explain(reference, candidate, config).total)
    }
}

fn factor_similarity(factor: Factor, reference: &Item, candidate: &Item, text: &TextOptions) -> f64 {
    match factor {
        Factor::Title => text_similarity(&reference.title, &candidate.title, text),
        Factor::Content => text_similarity(reference.body_text(), candidate.body_text(), text),
        Factor::Categories => jaccard(&reference.categories, &candidate.categories),
        Factor::Tags => jaccard(&reference.tags, &candidate.tags),
        Factor::Attributes => attribute_similarity(reference, candidate),
        Factor::PriceRange => price_similarity(reference.price, candidate.price),
        Factor::Brand => brand_similarity(reference, candidate),
    }
}

fn boosts_for(reference: &Item, candidate: &Item, config: &AlgorithmConfig) -> Vec<AppliedBoost> {
    let mut boosts = Vec::new();

    if config.boosts.temporal_boost {
        let diff = (reference.published_at - candidate.published_at).abs();
        if diff <= TEMPORAL_WINDOW_DAYS * SECONDS_PER_DAY {
            boosts.push(AppliedBoost {
                name: "temporal",
                multiplier: TEMPORAL_BOOST,
            });
        }
    }

    if config.boosts.popularity_boost && reference.sales > 0 && candidate.sales > 0 {
        let ratio = (candidate.sales as f64 / reference.sales as f64).min(POPULARITY_RATIO_CAP);
        boosts.push(AppliedBoost {
            name: "popularity",
            multiplier: 1.0 + ratio * POPULARITY_STEP,
        });
    }

    if config.boosts.category_boost
        && !reference.categories.is_disjoint(&candidate.categories)
    {
        boosts.push(AppliedBoost {
            name: "category",
            multiplier: CATEGORY_BOOST,
        });
    }

    boosts
}
