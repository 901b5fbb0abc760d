//! Algorithm configuration: typed fields, explicit defaults and validation.
//!
//! Resolution order for [`default_config`]:
//!
//! 1. `$RELATED_ITEMS_CONFIG` env var (path to a JSON file)
//! 2. `$XDG_DATA_HOME/related-items/config.json`
//! 3. `~/.local/share/related-items/config.json`
//! 4. Embedded compile-time default from `config/default.json`
//!
//! Any resolution step that fails falls through to the next.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siphasher::sip::SipHasher13;
use tracing::warn;

use crate::error::ConfigError;
use crate::model::TaxonomyKey;

const EMBEDDED_DEFAULT: &str = include_str!("../config/default.json");

pub const DEFAULT_THRESHOLD: f64 = 1.5;
pub const DEFAULT_LIMIT: usize = 6;

/// A scoring signal with its own weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Title,
    Content,
    Categories,
    Tags,
    Attributes,
    PriceRange,
    Brand,
}

impl Factor {
    pub const ALL: [Factor; 7] = [
        Factor::Title,
        Factor::Content,
        Factor::Categories,
        Factor::Tags,
        Factor::Attributes,
        Factor::PriceRange,
        Factor::Brand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Content => "content",
            Self::Categories => "categories",
            Self::Tags => "tags",
            Self::Attributes => "attributes",
            Self::PriceRange => "price_range",
            Self::Brand => "brand",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub title: f64,
    pub content: f64,
    pub categories: f64,
    pub tags: f64,
    pub attributes: f64,
    pub price_range: f64,
    pub brand: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            title: 3.0,
            content: 1.0,
            categories: 4.0,
            tags: 2.0,
            attributes: 1.0,
            price_range: 0.5,
            brand: 2.0,
        }
    }
}

impl Weights {
    /// All weights zero. Handy for tests that enable one factor at a time.
    pub fn zero() -> Self {
        Self {
            title: 0.0,
            content: 0.0,
            categories: 0.0,
            tags: 0.0,
            attributes: 0.0,
            price_range: 0.0,
            brand: 0.0,
        }
    }

    pub fn get(&self, factor: Factor) -> f64 {
        match factor {
            Factor::Title => self.title,
            Factor::Content => self.content,
            Factor::Categories => self.categories,
            Factor::Tags => self.tags,
            Factor::Attributes => self.attributes,
            Factor::PriceRange => self.price_range,
            Factor::Brand => self.brand,
        }
    }

    pub fn set(&mut self, factor: Factor, weight: f64) {
        let slot = match factor {
            Factor::Title => &mut self.title,
            Factor::Content => &mut self.content,
            Factor::Categories => &mut self.categories,
            Factor::Tags => &mut self.tags,
            Factor::Attributes => &mut self.attributes,
            Factor::PriceRange => &mut self.price_range,
            Factor::Brand => &mut self.brand,
        };
        *slot = weight;
    }

    pub fn with(mut self, factor: Factor, weight: f64) -> Self {
        self.set(factor, weight);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TextOptions {
    pub min_word_length: usize,
    pub use_stop_words: bool,
    pub use_stemming: bool,
    pub fuzzy_matching: bool,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            min_word_length: 3,
            use_stop_words: true,
            use_stemming: true,
            fuzzy_matching: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Boosts {
    pub cross_reference: bool,
    pub temporal_boost: bool,
    pub popularity_boost: bool,
    pub category_boost: bool,
}

impl Default for Boosts {
    fn default() -> Self {
        Self {
            cross_reference: false,
            temporal_boost: false,
            popularity_boost: false,
            category_boost: true,
        }
    }
}

impl Boosts {
    pub fn none() -> Self {
        Self {
            cross_reference: false,
            temporal_boost: false,
            popularity_boost: false,
            category_boost: false,
        }
    }
}

/// Scoring configuration. Immutable for the duration of one computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    pub threshold: f64,
    pub limit: usize,
    pub weights: Weights,
    pub text: TextOptions,
    pub boosts: Boosts,
    /// Hard filter: a candidate must share at least `n` terms in at least one
    /// listed taxonomy.
    pub required_taxonomies: BTreeMap<TaxonomyKey, usize>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            limit: DEFAULT_LIMIT,
            weights: Weights::default(),
            text: TextOptions::default(),
            boosts: Boosts::default(),
            required_taxonomies: BTreeMap::new(),
        }
    }
}

impl AlgorithmConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_boosts(mut self, boosts: Boosts) -> Self {
        self.boosts = boosts;
        self
    }

    pub fn with_text(mut self, text: TextOptions) -> Self {
        self.text = text;
        self
    }

    pub fn require(mut self, taxonomy: TaxonomyKey, min_shared: usize) -> Self {
        self.required_taxonomies.insert(taxonomy, min_shared);
        self
    }

    /// True when [`validated`](Self::validated) would change nothing.
    pub fn is_valid(&self) -> bool {
        self.threshold.is_finite()
            && self.threshold >= 0.0
            && self.limit > 0
            && Factor::ALL.iter().all(|&f| {
                let w = self.weights.get(f);
                w.is_finite() && w >= 0.0
            })
            && self.required_taxonomies.values().all(|&min| min > 0)
    }

    /// Replace malformed fields with their defaults.
    ///
    /// Returns the corrected config and one message per substitution.
    pub fn validated(mut self) -> (Self, Vec<String>) {
        let mut fixes = Vec::new();
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            fixes.push(format!(
                "threshold {} is invalid, using {DEFAULT_THRESHOLD}",
                self.threshold
            ));
            self.threshold = DEFAULT_THRESHOLD;
        }
        if self.limit == 0 {
            fixes.push(format!("limit 0 is invalid, using {DEFAULT_LIMIT}"));
            self.limit = DEFAULT_LIMIT;
        }
        let defaults = Weights::default();
        for factor in Factor::ALL {
            let w = self.weights.get(factor);
            if !w.is_finite() || w < 0.0 {
                let fallback = defaults.get(factor);
                fixes.push(format!(
                    "weight {} = {w} is invalid, using {fallback}",
                    factor.as_str()
                ));
                self.weights.set(factor, fallback);
            }
        }
        self.required_taxonomies.retain(|key, min| {
            if *min == 0 {
                fixes.push(format!(
                    "required taxonomy {} with minimum 0 ignored",
                    key.as_str()
                ));
                false
            } else {
                true
            }
        });
        for fix in &fixes {
            warn!(fix = %fix, "config value substituted");
        }
        (self, fixes)
    }

    /// Build a config from a settings store, substituting defaults per key
    /// when a value is missing or malformed.
    pub fn from_settings(settings: &dyn SettingsStore) -> Self {
        let defaults = Self::default();
        let config = Self {
            threshold: setting_or(settings, "threshold", defaults.threshold),
            limit: setting_or(settings, "limit", defaults.limit),
            weights: setting_or(settings, "weights", defaults.weights),
            text: setting_or(settings, "text", defaults.text),
            boosts: setting_or(settings, "boosts", defaults.boosts),
            required_taxonomies: setting_or(
                settings,
                "required_taxonomies",
                defaults.required_taxonomies,
            ),
        };
        config.validated().0
    }

    /// Stable 64-bit hash of the parameters that shape stored scores.
    /// `limit` only filters at read time and is left out. `threshold` stays
    /// in because fallback rows are stored at the threshold score.
    pub fn fingerprint(&self) -> u64 {
        let params = ScoringParams {
            threshold: self.threshold,
            weights: &self.weights,
            text: &self.text,
            boosts: &self.boosts,
            required_taxonomies: &self.required_taxonomies,
        };
        let json = serde_json::to_string(&params).unwrap_or_default();
        let mut hasher = SipHasher13::new();
        json.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Serialize)]
struct ScoringParams<'a> {
    threshold: f64,
    weights: &'a Weights,
    text: &'a TextOptions,
    boosts: &'a Boosts,
    required_taxonomies: &'a BTreeMap<TaxonomyKey, usize>,
}

fn setting_or<T: DeserializeOwned>(settings: &dyn SettingsStore, key: &str, default: T) -> T {
    match settings.get(key) {
        None | Some(Value::Null) => default,
        Some(value) => match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(key, error = %e, "malformed setting, using default");
                default
            }
        },
    }
}

/// Key/value settings source.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// Settings backed by a JSON object.
#[derive(Debug, Clone, Default)]
pub struct JsonSettings {
    values: serde_json::Map<String, Value>,
}

impl JsonSettings {
    pub fn new(values: serde_json::Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let values = serde_json::from_str(json)?;
        Ok(Self { values })
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }
}

impl SettingsStore for JsonSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

/// Parse a config from a JSON string. Malformed field values are replaced
/// with defaults; only invalid JSON is an error.
pub fn parse_config(json: &str) -> Result<AlgorithmConfig, ConfigError> {
    let settings = JsonSettings::from_json(json)?;
    Ok(AlgorithmConfig::from_settings(&settings))
}

/// Load a config from a file path.
pub fn load_config(path: &Path) -> Result<AlgorithmConfig, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&json)
}

/// Resolve the config using the documented order.
pub fn default_config() -> AlgorithmConfig {
    if let Ok(path) = std::env::var("RELATED_ITEMS_CONFIG") {
        if let Ok(config) = load_config(Path::new(&path)) {
            return config;
        }
    }

    if let Some(path) = xdg_config_path() {
        if path.exists() {
            if let Ok(config) = load_config(&path) {
                return config;
            }
        }
    }

    parse_config(EMBEDDED_DEFAULT).unwrap_or_default()
}

fn xdg_config_path() -> Option<PathBuf> {
    let data_home = std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local/share"))
        })?;
    Some(data_home.join("related-items/config.json"))
}

/// The embedded default config as a JSON string, for seeding user files.
pub fn embedded_default_json() -> &'static str {
    EMBEDDED_DEFAULT
}
