//! Related-item recommendations for a product catalog.
//!
//! Items are scored against each other on weighted text, taxonomy, price and
//! brand signals, and the results are kept in a relation store behind a
//! cache-aside [`CacheManager`]. [`batch`] rebuilds the whole cache.

pub mod algo;
pub mod batch;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod model;
pub mod ops;
pub mod store;

pub use algo::similarity::{Scorer, WeightedScorer};
pub use batch::{build_cache, BatchBuilder, BuildOptions, BuildReport, CancelToken};
pub use cache::{CacheManager, CacheStats, ManagerOptions};
pub use catalog::{Catalog, InMemoryCatalog, ItemFilter};
pub use config::AlgorithmConfig;
pub use error::{Error, Result};
pub use model::{CacheState, Item, ItemId, ScoredRelation};
pub use store::{MemoryStore, RelationStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
