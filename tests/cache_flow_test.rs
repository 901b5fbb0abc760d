//! End-to-end cache flows against the on-disk SQLite store.

use std::sync::Arc;
use std::thread;

use related_items::batch::{BatchBuilder, BuildOptions};
use related_items::config::{Boosts, Factor, Weights};
use related_items::model::TaxonomyKey;
use related_items::{
    AlgorithmConfig, CacheManager, CacheState, InMemoryCatalog, Item, SqliteStore, WeightedScorer,
};

fn headphones_catalog() -> InMemoryCatalog {
    InMemoryCatalog::from_items([
        Item::new(1, "Wireless Headphones").with_categories(["Audio"]),
        Item::new(2, "Wireless Earbuds").with_categories(["Audio"]),
        Item::new(3, "Wireless Headphones Stand").with_categories(["Furniture"]),
        Item::new(4, "Desk Lamp").with_categories(["Furniture"]),
    ])
}

fn manager_at(path: &str, catalog: Arc<InMemoryCatalog>) -> CacheManager {
    CacheManager::new(
        catalog,
        Arc::new(SqliteStore::open_or_create(path).unwrap()),
        Arc::new(WeightedScorer::new()),
    )
}

fn title_and_category() -> AlgorithmConfig {
    AlgorithmConfig::default()
        .with_weights(
            Weights::zero()
                .with(Factor::Title, 3.0)
                .with(Factor::Categories, 4.0),
        )
        .with_boosts(Boosts::none())
        .with_threshold(1.5)
}

#[test]
fn headphones_relate_to_earbuds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("related.db");
    let m = manager_at(path.to_str().unwrap(), Arc::new(headphones_catalog()));

    let config = title_and_category();
    let related = m.get_related(1, &config).unwrap();
    assert_eq!(related[0].related_id, 2);
    assert!((related[0].score - 5.0).abs() < 1e-9);
}

#[test]
fn required_taxonomy_excludes_text_lookalike() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("related.db");
    let m = manager_at(path.to_str().unwrap(), Arc::new(headphones_catalog()));

    let config = title_and_category()
        .with_threshold(0.0)
        .require(TaxonomyKey::Category, 1);
    let ids = m.get_related_ids(1, &config).unwrap();
    assert_eq!(ids, vec![2]);
    assert_eq!(m.get_score(1, 3).unwrap(), None);
}

#[test]
fn relations_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("related.db");
    let path = path.to_str().unwrap();
    let catalog = Arc::new(headphones_catalog());
    let config = title_and_category().with_threshold(0.0);

    let before = {
        let m = manager_at(path, catalog.clone());
        let report = BatchBuilder::new(&m, &config)
            .with_options(BuildOptions {
                batch_size: 2,
                ..BuildOptions::default()
            })
            .run();
        assert_eq!(report.processed, 4);
        m.get_related_ids(1, &config).unwrap()
    };

    let m = manager_at(path, catalog);
    assert!(!m.sync_config(&config).unwrap());
    assert!(m.is_cached(4).unwrap());
    assert_eq!(m.get_related_ids(1, &config).unwrap(), before);
}

#[test]
fn config_change_invalidates_persisted_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("related.db");
    let path = path.to_str().unwrap();
    let catalog = Arc::new(headphones_catalog());

    {
        let m = manager_at(path, catalog.clone());
        let config = title_and_category();
        m.sync_config(&config).unwrap();
        m.enforce_cache(1, &config).unwrap();
    }

    let m = manager_at(path, catalog.clone());
    // limit is applied at read time, the stored scores stay valid
    let narrower = title_and_category().with_limit(3);
    assert!(!m.sync_config(&narrower).unwrap());
    assert!(m.is_cached(1).unwrap());
    drop(m);

    let m = manager_at(path, catalog);
    let changed = title_and_category().with_weights(
        Weights::zero()
            .with(Factor::Title, 1.0)
            .with(Factor::Categories, 4.0),
    );
    assert!(m.sync_config(&changed).unwrap());
    assert_eq!(m.state(1).unwrap(), CacheState::Absent);
}

#[test]
fn concurrent_readers_share_one_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("related.db");
    let m = Arc::new(manager_at(path.to_str().unwrap(), Arc::new(headphones_catalog())));
    let config = Arc::new(title_and_category().with_threshold(0.0));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let m = Arc::clone(&m);
            let config = Arc::clone(&config);
            thread::spawn(move || {
                let id = (i % 4) + 1;
                m.get_related_ids(id, &config).unwrap()
            })
        })
        .collect();
    for handle in handles {
        let ids = handle.join().unwrap();
        assert!(!ids.is_empty());
    }

    let stats = m.get_stats().unwrap();
    assert_eq!(stats.total_items, 4);
    assert_eq!(stats.cached_items, 4);
}

#[test]
fn deleted_item_cascades_out_of_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("related.db");
    let catalog = Arc::new(headphones_catalog());
    let m = manager_at(path.to_str().unwrap(), catalog.clone());
    let config = title_and_category().with_threshold(0.0);

    m.enforce_cache(1, &config).unwrap();
    m.enforce_cache(3, &config).unwrap();
    let referencing = m.get_related_references(2).unwrap();
    assert!(referencing.contains_key(&1));

    catalog.remove(2).unwrap();
    m.clear(referencing.keys().copied().chain([2])).unwrap();
    assert!(!m.is_cached(1).unwrap());

    let ids = m.get_related_ids(1, &config).unwrap();
    assert!(!ids.contains(&2));
}
