/// Save/load of whole stores, including partial failures.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use mnemodb_core::storage::persistence::{read_document, METADATA_FILE};
use mnemodb_core::{
    ErrorCode, HnswIndex, IndexHit, MemoryConfig, MemoryStore, MnemoError, NewMemory, Result, SlotId,
    TombstoneReason, VectorIndex,
};
use tempfile::TempDir;

/// HNSW index whose `persist` fails while `fail` is raised.
struct FlakyIndex {
    inner: HnswIndex,
    fail: Arc<AtomicBool>,
}

impl VectorIndex for FlakyIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn insert(&mut self, vector: &[f32]) -> Result<SlotId> {
        self.inner.insert(vector)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        self.inner.search(query, k)
    }

    fn search_within(&self, query: &[f32], k: usize, allowed: &HashSet<SlotId>) -> Result<Vec<IndexHit>> {
        self.inner.search_within(query, k, allowed)
    }

    fn get(&self, slot: SlotId) -> Option<Vec<f32>> {
        self.inner.get(slot)
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn tombstone(&mut self, slot: SlotId, reason: TombstoneReason) -> Result<()> {
        self.inner.tombstone(slot, reason)
    }

    fn is_tombstoned(&self, slot: SlotId) -> bool {
        self.inner.is_tombstoned(slot)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        if self.fail.load(Ordering::Acquire) {
            return Err(MnemoError::PersistenceFailure("disk full".to_string()));
        }
        self.inner.persist(path)
    }

    fn restore(&mut self, path: &Path, capacity: usize) -> Result<()> {
        self.inner.restore(path, capacity)
    }
}

fn index_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".index"))
        .collect();
    names.sort();
    names
}

fn populated_store() -> MemoryStore {
    let store = MemoryStore::new(MemoryConfig::default()).unwrap();
    store.create_category("episodic", 4).unwrap();
    store.create_category("semantic", 3).unwrap();
    for i in 0..12 {
        let x = i as f32 / 12.0;
        store
            .insert(
                NewMemory::new("episodic", vec![1.0 - x, x, 0.5, 0.1])
                    .with_id(format!("e{}", i))
                    .with_content(format!("event {}", i))
                    .with_labels(["daily"]),
            )
            .unwrap();
    }
    for i in 0..5 {
        store
            .insert(NewMemory::new("semantic", vec![0.0, 1.0, i as f32]).with_id(format!("s{}", i)))
            .unwrap();
    }
    store.remove("episodic", "e3").unwrap();
    store.recluster("episodic").unwrap();
    store
}

#[test]
fn test_round_trip_restores_every_category() {
    let dir = TempDir::new().unwrap();
    let store = populated_store();
    store.save(dir.path()).unwrap();

    let restored = MemoryStore::new(MemoryConfig::default()).unwrap();
    restored.load(dir.path()).unwrap();

    assert_eq!(restored.categories(), store.categories());
    for category in store.categories() {
        assert_eq!(restored.live_slots(&category).unwrap(), store.live_slots(&category).unwrap());
        assert_eq!(restored.records(&category).unwrap(), store.records(&category).unwrap());
        assert_eq!(restored.clusters(&category).unwrap(), store.clusters(&category).unwrap());
        assert_eq!(restored.partitions(&category).unwrap(), store.partitions(&category).unwrap());
    }
    let archived = restored.archived("episodic").unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].record.id, "e3");

    let query = [0.9, 0.1, 0.5, 0.1];
    let expected = store.query_similar("episodic", &query, 3, 0.0).unwrap();
    assert_eq!(restored.query_similar("episodic", &query, 3, 0.0).unwrap(), expected);

    // Slots keep counting past the restored ones
    let slot = restored.insert(NewMemory::new("episodic", vec![0.5, 0.5, 0.5, 0.1])).unwrap();
    assert_eq!(slot, 12);
    assert!(matches!(
        restored.insert(NewMemory::new("episodic", vec![0.5, 0.5, 0.5, 0.1]).with_id("e1")),
        Err(MnemoError::DuplicateMemoryId(_))
    ));
}

#[test]
fn test_repeated_saves_keep_one_index_per_category() {
    let dir = TempDir::new().unwrap();
    let store = populated_store();
    store.save(dir.path()).unwrap();
    store.insert(NewMemory::new("semantic", vec![1.0, 0.0, 0.0])).unwrap();
    store.save(dir.path()).unwrap();

    let doc = read_document(dir.path()).unwrap().unwrap();
    let index_files = index_files(dir.path());
    let mut referenced: Vec<String> = doc.categories.values().map(|s| s.index_file.clone()).collect();
    referenced.sort();
    assert_eq!(index_files, referenced);
    assert_eq!(doc.categories["semantic"].records.len(), 6);
}

#[test]
fn test_corrupt_category_loads_empty_and_others_survive() {
    let dir = TempDir::new().unwrap();
    populated_store().save(dir.path()).unwrap();

    let doc = read_document(dir.path()).unwrap().unwrap();
    fs::write(dir.path().join(&doc.categories["semantic"].index_file), b"garbage").unwrap();

    let restored = MemoryStore::new(MemoryConfig::default()).unwrap();
    let err = restored.load(dir.path()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PersistenceFailure);
    assert!(err.to_string().contains("semantic"));

    assert_eq!(restored.live_slots("episodic").unwrap().len(), 11);
    assert!(restored.live_slots("semantic").unwrap().is_empty());
    assert!(restored.clusters("semantic").unwrap().is_empty());

    // The emptied category is usable
    let slot = restored.insert(NewMemory::new("semantic", vec![0.0, 1.0, 0.0])).unwrap();
    assert_eq!(slot, 0);
    assert_eq!(restored.query_similar("semantic", &[0.0, 1.0, 0.0], 1, 0.9).unwrap().len(), 1);
}

#[test]
fn test_load_without_metadata_fails() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(MemoryConfig::default()).unwrap();
    assert!(matches!(store.load(dir.path()), Err(MnemoError::PersistenceFailure(_))));
    assert!(store.categories().is_empty());
}

#[test]
fn test_similar_category_names_get_separate_index_files() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(MemoryConfig::default()).unwrap();
    store.create_category("a b", 2).unwrap();
    store.create_category("a_b", 2).unwrap();
    store.insert(NewMemory::new("a b", vec![1.0, 0.0]).with_id("space")).unwrap();
    store.insert(NewMemory::new("a_b", vec![0.0, 1.0]).with_id("underscore")).unwrap();
    store.save(dir.path()).unwrap();

    let doc = read_document(dir.path()).unwrap().unwrap();
    assert_ne!(doc.categories["a b"].index_file, doc.categories["a_b"].index_file);
    assert_eq!(index_files(dir.path()).len(), 2);

    let restored = MemoryStore::new(MemoryConfig::default()).unwrap();
    restored.load(dir.path()).unwrap();
    let hits = restored.query_similar("a b", &[1.0, 0.0], 1, 0.0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory_id, "space");
    assert!(hits[0].similarity > 0.99);
    let hits = restored.query_similar("a_b", &[0.0, 1.0], 1, 0.0).unwrap();
    assert_eq!(hits[0].memory_id, "underscore");
    assert!(hits[0].similarity > 0.99);
}

#[test]
fn test_failed_category_keeps_last_saved_version() {
    let dir = TempDir::new().unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let store = MemoryStore::new(MemoryConfig::default()).unwrap();
    let index = HnswIndex::new(2, MemoryConfig::default().index);
    store
        .register_category("flaky", Box::new(FlakyIndex { inner: index, fail: fail.clone() }))
        .unwrap();
    store.create_category("steady", 2).unwrap();
    store.insert(NewMemory::new("flaky", vec![1.0, 0.0]).with_id("f0")).unwrap();
    store.insert(NewMemory::new("steady", vec![0.0, 1.0]).with_id("s0")).unwrap();
    store.save(dir.path()).unwrap();
    let first = read_document(dir.path()).unwrap().unwrap();

    store.insert(NewMemory::new("flaky", vec![0.9, 0.1]).with_id("f1")).unwrap();
    store.insert(NewMemory::new("steady", vec![0.1, 0.9]).with_id("s1")).unwrap();
    fail.store(true, Ordering::Release);

    let err = store.save(dir.path()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PersistenceFailure);
    assert!(err.to_string().contains("flaky"));
    assert!(!err.to_string().contains("steady"));

    let second = read_document(dir.path()).unwrap().unwrap();
    let kept = &second.categories["flaky"];
    assert_eq!(kept.index_file, first.categories["flaky"].index_file);
    assert_eq!(kept.index_generation, first.categories["flaky"].index_generation);
    assert_eq!(kept.records.len(), 1);
    assert!(dir.path().join(&kept.index_file).exists());

    let updated = &second.categories["steady"];
    assert!(updated.index_generation > first.categories["steady"].index_generation);
    assert_eq!(updated.records.len(), 2);
    assert!(!dir.path().join(&first.categories["steady"].index_file).exists());

    let mut referenced: Vec<String> = second.categories.values().map(|s| s.index_file.clone()).collect();
    referenced.sort();
    assert_eq!(index_files(dir.path()), referenced);

    // The kept section still loads
    let restored = MemoryStore::new(MemoryConfig::default()).unwrap();
    restored.load(dir.path()).unwrap();
    assert_eq!(restored.live_slots("flaky").unwrap(), vec![0]);
    assert_eq!(restored.live_slots("steady").unwrap(), vec![0, 1]);
}

#[test]
fn test_unwritable_metadata_discards_new_index_files() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join(METADATA_FILE)).unwrap();

    let err = populated_store().save(dir.path()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PersistenceFailure);
    assert!(index_files(dir.path()).is_empty());
    assert!(dir.path().join(METADATA_FILE).is_dir());
}
