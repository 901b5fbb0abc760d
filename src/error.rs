//! Error types for the related-items engine.
//!
//! Only `StoreError` and `CatalogError` ever reach callers of the cache
//! manager. `ComputeError` is consumed internally by the fallback path and
//! `ConfigError` only surfaces when loading a config file explicitly.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::ItemId;

/// Failure reported by a catalog implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("catalog query failed: {0}")]
    Query(String),
}

/// Failure reported by a relation store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("relation store backend error: {0}")]
    Backend(String),
    #[error("relation store lock poisoned")]
    Poisoned,
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Failure while computing relations for one reference item.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ComputeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("scoring candidate {candidate} failed: {message}")]
    Scoring { candidate: ItemId, message: String },
    #[error("computation exceeded {0:?}")]
    Timeout(Duration),
    #[error("computation worker failed: {0}")]
    Worker(String),
}

/// Failure loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Umbrella error for operations exposed to callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("item {0} was not found in the catalog")]
    NotFound(ItemId),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
