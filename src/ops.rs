//! Operation wrappers for outer interfaces (CLI, admin tooling).
//!
//! Each `op_*` function drives the cache manager or one algorithm and returns
//! a `serde_json::Value`. Fallible operations return `Result<Value, String>`
//! with a human-readable message.

use serde_json::{json, Value};

use crate::algo::similarity::WeightedScorer;
use crate::algo::tokenizer;
use crate::batch::{BatchBuilder, BuildOptions};
use crate::cache::CacheManager;
use crate::catalog::Catalog;
use crate::config::{AlgorithmConfig, TextOptions};
use crate::model::{CacheState, ItemId};

fn state_json(state: CacheState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

/// Related items for `id`, computing on a miss.
pub fn op_related(manager: &CacheManager, id: ItemId, config: &AlgorithmConfig) -> Result<Value, String> {
    let relations = manager
        .get_related(id, config)
        .map_err(|e| format!("Could not load related items for {id}: {e}"))?;
    let state = manager.state(id).map_err(|e| e.to_string())?;

    let related: Vec<Value> = relations
        .iter()
        .map(|r| json!({"id": r.related_id, "score": r.score}))
        .collect();
    Ok(json!({
        "reference": id,
        "cache": state_json(state),
        "related": related,
    }))
}

/// Score breakdown between two catalog items. Does not touch the cache.
pub fn op_score(
    catalog: &dyn Catalog,
    reference: ItemId,
    candidate: ItemId,
    config: &AlgorithmConfig,
) -> Result<Value, String> {
    let find = |id: ItemId| -> Result<_, String> {
        catalog
            .get_item(id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Item {id} not found"))
    };
    let a = find(reference)?;
    let b = find(candidate)?;

    let breakdown = WeightedScorer::new().explain(&a, &b, config);
    Ok(json!({
        "reference": reference,
        "candidate": candidate,
        "factors": breakdown.factors,
        "raw": breakdown.raw,
        "boosts": breakdown.boosts,
        "total": breakdown.total,
        "meets_threshold": breakdown.total >= config.threshold,
    }))
}

pub fn op_stats(manager: &CacheManager) -> Result<Value, String> {
    let stats = manager.get_stats().map_err(|e| e.to_string())?;
    serde_json::to_value(stats).map_err(|e| e.to_string())
}

pub fn op_build(manager: &CacheManager, config: &AlgorithmConfig, options: BuildOptions) -> Value {
    let report = BatchBuilder::new(manager, config).with_options(options).run();
    serde_json::to_value(report).unwrap_or(Value::Null)
}

pub fn op_clear(manager: &CacheManager, ids: &[ItemId]) -> Result<Value, String> {
    let removed = manager
        .clear(ids.iter().copied())
        .map_err(|e| format!("Could not clear relations: {e}"))?;
    Ok(json!({"cleared": ids, "removed_rows": removed}))
}

pub fn op_clear_all(manager: &CacheManager) -> Result<Value, String> {
    let removed = manager
        .clear_all()
        .map_err(|e| format!("Could not clear relation cache: {e}"))?;
    Ok(json!({"cleared": "all", "removed_rows": removed}))
}

pub fn op_rebuild(manager: &CacheManager, id: ItemId, config: &AlgorithmConfig) -> Result<Value, String> {
    let state = manager
        .rebuild_item(id, config)
        .map_err(|e| format!("Could not rebuild relations for {id}: {e}"))?;
    Ok(json!({"reference": id, "cache": state_json(state)}))
}

pub fn op_tokenize(text: &str, options: &TextOptions) -> Value {
    let tokens: Vec<String> = tokenizer::tokenize(text, options).into_iter().collect();
    json!({"text": text, "count": tokens.len(), "tokens": tokens})
}

/// Effective config after validation, with its fingerprint and any
/// substitutions that were made.
pub fn op_config(config: &AlgorithmConfig) -> Value {
    let (effective, fixes) = config.clone().validated();
    json!({
        "config": effective,
        "fingerprint": format!("{:016x}", effective.fingerprint()),
        "fixes": fixes,
    })
}
