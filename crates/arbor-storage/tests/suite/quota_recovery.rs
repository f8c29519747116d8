use arbor_storage::{
    DirRawStore, MemoryRawStore, QuotaBackend, QuotaConfig, RawStore, StorageBackend,
    StorageError,
};
use serde_json::json;

fn fill(backend: &impl StorageBackend, count: usize) {
    for i in 0..count {
        backend
            .set(&format!("entry-{i}"), json!("x".repeat(200)))
            .unwrap();
    }
}

/// A raw store much smaller than the soft budget, so only hard quota failures trigger
/// eviction.
fn tight_backend(raw_capacity: u64) -> QuotaBackend<MemoryRawStore> {
    QuotaBackend::open(
        MemoryRawStore::with_capacity(raw_capacity),
        QuotaConfig {
            key_prefix: "q:".to_string(),
            max_bytes: u64::MAX,
            max_retries: 3,
        },
    )
}

#[test]
fn hard_quota_failure_evicts_then_succeeds() {
    // Eight ~211 byte entries plus the metadata record fit; one more 300 byte value does not.
    let backend = tight_backend(2_200);
    fill(&backend, 8);
    let before = backend.len();

    let value = json!("x".repeat(300));
    backend.set("big", value.clone()).unwrap();

    assert!(backend.len() <= before, "expected at least one eviction");
    assert_eq!(backend.get("big").unwrap(), Some(value));
    // Oldest entries go first.
    assert!(!backend.has("entry-0").unwrap());
    assert!(backend.has("entry-7").unwrap());
}

#[test]
fn exhausted_retries_surface_the_oversized_key() {
    let backend = tight_backend(2_200);
    fill(&backend, 8);

    let err = backend
        .set("huge", json!("x".repeat(10_000)))
        .expect_err("write larger than the raw store must fail");

    match &err {
        StorageError::QuotaExceeded { key, attempts } => {
            assert_eq!(key, "huge");
            // One initial attempt plus the configured three retries.
            assert_eq!(*attempts, 4);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("huge"));
    // Retries evicted 2 + 1 + 1 entries.
    assert_eq!(backend.len(), 4);
    assert!(!backend.has("huge").unwrap());
}

#[test]
fn empty_store_fails_without_retrying() {
    let backend = tight_backend(10);
    let err = backend.set("only", json!("x".repeat(100))).unwrap_err();
    assert!(matches!(
        err,
        StorageError::QuotaExceeded { attempts: 1, .. }
    ));
}

#[test]
fn directory_store_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let config = QuotaConfig {
        key_prefix: "arbor:".to_string(),
        max_bytes: 1024,
        max_retries: 3,
    };
    {
        let backend = QuotaBackend::open(DirRawStore::open(tmp.path()).unwrap(), config.clone());
        backend.set("tree", json!({"children": [1, 2, 3]})).unwrap();
    }

    let store = DirRawStore::open(tmp.path()).unwrap();
    assert!(store.keys().unwrap().contains(&"arbor:__meta__".to_string()));
    let backend = QuotaBackend::open(store, config);
    assert_eq!(
        backend.get("tree").unwrap(),
        Some(json!({"children": [1, 2, 3]}))
    );
    assert!(backend.entry_meta("tree").unwrap().timestamp > 0);
}
