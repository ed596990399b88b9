use serde_json::json;
use tempfile::tempdir;

use resctl::catalog::{CatalogStore, FlushBatch, JsonFileStore, MemoryCatalogStore};
use resctl::types::Resource;
use resctl_test_utils::builders::rn;

#[tokio::test]
async fn memory_store_applies_batches() {
    let store = MemoryCatalogStore::with_resources([Resource::new(rn("a"), json!({}))]);

    store
        .flush(FlushBatch {
            upserts: vec![Resource::new(rn("b"), json!({ "v": 1 }))],
            deletes: vec![rn("a")],
        })
        .await
        .unwrap();

    let loaded = store.load().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].meta.name, rn("b"));
    assert_eq!(store.get(&rn("b")).map(|r| r.spec), Some(json!({ "v": 1 })));
}

#[tokio::test]
async fn file_store_missing_file_loads_empty() {
    let dir = tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("nested").join("catalog.json"));
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn file_store_persists_across_instances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("catalog.json");

    let store = JsonFileStore::new(&path);
    store
        .flush(FlushBatch {
            upserts: vec![
                Resource::new(rn("a"), json!({ "cmd": "true" })),
                Resource::new(rn("b"), json!({})),
            ],
            deletes: vec![],
        })
        .await
        .unwrap();
    store
        .flush(FlushBatch {
            upserts: vec![Resource::new(rn("a"), json!({ "cmd": "false" }))],
            deletes: vec![rn("b")],
        })
        .await
        .unwrap();

    let reopened = JsonFileStore::new(&path);
    let loaded = reopened.load().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].meta.name, rn("a"));
    assert_eq!(loaded[0].spec, json!({ "cmd": "false" }));
}
