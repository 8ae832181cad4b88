/// Integration tests for the store's organization guarantees:
/// 1. Every live slot sits in exactly one cluster and one partition
/// 2. Merge/split keep membership
/// 3. Rebalance reaches a fixpoint
/// 4. Decay only ever lowers strength, down to the floor
/// 5. The result cache never exceeds its byte budget

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use mnemodb_core::{
    ClusterId, MemoryConfig, MemoryStore, MnemoError, NewMemory, RayonExecutor, ResultCache, SlotId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DAY: u64 = 86_400_000;

fn small_partitions() -> MemoryConfig {
    let mut config = MemoryConfig::default();
    config.partition.max_partition_size = 8;
    config.partition.min_partition_size = 3;
    config
}

/// `per_center` jittered vectors around each of `centers` random directions.
fn clustered_vectors(rng: &mut StdRng, dim: usize, centers: usize, per_center: usize) -> Vec<Vec<f32>> {
    let bases: Vec<Vec<f32>> = (0..centers)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let mut vectors = Vec::with_capacity(centers * per_center);
    for base in &bases {
        for _ in 0..per_center {
            vectors.push(base.iter().map(|x| x + rng.gen_range(-0.05..0.05)).collect());
        }
    }
    vectors
}

fn assert_organized(store: &MemoryStore, category: &str) {
    let live: BTreeSet<SlotId> = store.live_slots(category).unwrap().into_iter().collect();

    let mut cluster_members: BTreeMap<ClusterId, usize> = BTreeMap::new();
    for &slot in &live {
        let cluster = store.cluster_of(category, slot).unwrap();
        let cluster = cluster.unwrap_or_else(|| panic!("slot {} has no cluster", slot));
        *cluster_members.entry(cluster).or_default() += 1;
    }
    for meta in store.clusters(category).unwrap() {
        assert_eq!(cluster_members.get(&meta.id).copied().unwrap_or(0), meta.size, "cluster {} size", meta.id);
    }
    let total: usize = store.clusters(category).unwrap().iter().map(|c| c.size).sum();
    assert_eq!(total, live.len());

    let mut seen = BTreeSet::new();
    for partition in store.partitions(category).unwrap() {
        assert!(!partition.members.is_empty());
        for slot in &partition.members {
            assert!(seen.insert(*slot), "slot {} in two partitions", slot);
            assert_eq!(store.partition_of(category, *slot).unwrap(), Some(partition.id));
        }
    }
    assert_eq!(seen, live);
}

#[test]
fn test_every_slot_in_one_cluster_and_one_partition() {
    let store = MemoryStore::new(small_partitions()).unwrap();
    store.create_category("episodic", 6).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for vector in clustered_vectors(&mut rng, 6, 4, 15) {
        store.insert(NewMemory::new("episodic", vector)).unwrap();
        assert_organized(&store, "episodic");
    }

    assert!(store.recluster("episodic").unwrap());
    assert_organized(&store, "episodic");

    let mut clusters = store.clusters("episodic").unwrap();
    clusters.sort_by_key(|c| std::cmp::Reverse(c.size));
    let merged = store.merge_clusters("episodic", clusters[0].id, clusters[1].id).unwrap();
    assert_organized(&store, "episodic");

    store.split_cluster("episodic", merged).unwrap();
    assert_organized(&store, "episodic");

    store.rebalance("episodic").unwrap();
    assert_organized(&store, "episodic");

    for slot in [3usize, 17, 42] {
        let record = &store.records("episodic").unwrap().into_iter().find(|(s, _)| *s == slot).unwrap().1;
        store.remove("episodic", &record.id).unwrap();
    }
    assert_organized(&store, "episodic");
}

#[test]
fn test_concurrent_writers_and_readers_see_consistent_tables() {
    let executor = Arc::new(RayonExecutor::new(2).unwrap());
    let store = MemoryStore::builder(small_partitions()).executor(executor).build().unwrap();
    store.create_category("episodic", 4).unwrap();

    let handles: Vec<_> = (0..4u64)
        .map(|seed| {
            let store = store.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for vector in clustered_vectors(&mut rng, 4, 2, 20) {
                    store.insert(NewMemory::new("episodic", vector.clone())).unwrap();
                    let hits = store.query_similar("episodic", &vector, 5, -1.0).unwrap();
                    assert!(!hits.is_empty());
                    assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Let background passes drain
    for _ in 0..500 {
        if store.stats("episodic").unwrap().activity == mnemodb_core::CategoryActivity::Idle {
            break;
        }
        thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(store.live_slots("episodic").unwrap().len(), 160);
    assert_organized(&store, "episodic");
}

#[test]
fn test_split_of_merge_keeps_membership() {
    let mut config = MemoryConfig::default();
    config.cluster.min_clusters = 3;
    config.cluster.max_clusters = 3;
    let store = MemoryStore::new(config).unwrap();
    store.create_category("semantic", 5).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for vector in clustered_vectors(&mut rng, 5, 3, 10) {
        store.insert(NewMemory::new("semantic", vector)).unwrap();
    }
    assert!(store.recluster("semantic").unwrap());

    let clusters = store.clusters("semantic").unwrap();
    let (a, b) = (clusters[0].id, clusters[1].id);
    let members_of = |ids: &[ClusterId]| -> BTreeSet<SlotId> {
        store
            .live_slots("semantic")
            .unwrap()
            .into_iter()
            .filter(|s| ids.contains(&store.cluster_of("semantic", *s).unwrap().unwrap()))
            .collect()
    };
    let before = members_of(&[a, b]);

    let merged = store.merge_clusters("semantic", a, b).unwrap();
    assert_eq!(members_of(&[merged]), before);

    let (left, right) = store.split_cluster("semantic", merged).unwrap();
    assert_ne!(left, right);
    assert_eq!(members_of(&[left, right]), before);
    assert!(!members_of(&[left]).is_empty());
    assert!(!members_of(&[right]).is_empty());

    assert!(matches!(
        store.merge_clusters("semantic", merged, left),
        Err(MnemoError::InvalidClusterId { .. })
    ));
}

#[test]
fn test_rebalance_twice_changes_nothing() {
    let store = MemoryStore::new(small_partitions()).unwrap();
    store.create_category("episodic", 3).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    for vector in clustered_vectors(&mut rng, 3, 3, 12) {
        store.insert(NewMemory::new("episodic", vector)).unwrap();
    }

    store.rebalance("episodic").unwrap();
    let first = store.partitions("episodic").unwrap();
    assert!(first.iter().all(|p| p.size() <= 8));

    assert!(!store.rebalance("episodic").unwrap());
    assert_eq!(store.partitions("episodic").unwrap(), first);
}

#[test]
fn test_decay_never_raises_strength_nor_passes_the_floor() {
    let mut config = MemoryConfig::default();
    config.consolidation.enabled = false;
    let store = MemoryStore::new(config).unwrap();
    store.create_category("episodic", 2).unwrap();
    store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("fading")).unwrap();
    store.insert(NewMemory::new("episodic", vec![0.0, 1.0]).with_id("sticky").with_importance(1.0)).unwrap();

    let start = mnemodb_core::core::current_timestamp_ms();
    let mut last: BTreeMap<String, f32> = BTreeMap::new();
    for day in 1..=12u64 {
        let report = store.run_maintenance_at(start + day * DAY);
        assert!(!report.skipped);

        for (_, record) in store.records("episodic").unwrap() {
            assert!(record.strength >= 0.1);
            if let Some(prev) = last.get(&record.id) {
                assert!(record.strength <= *prev, "{} rose on day {}", record.id, day);
            }
            last.insert(record.id.clone(), record.strength);
        }
    }

    // 0.2 per day at importance 0.5: floored on day 5
    let archived = store.archived("episodic").unwrap();
    assert!(archived.iter().any(|a| a.record.id == "fading"));
    for entry in &archived {
        assert!(entry.record.strength >= 0.1);
    }
}

#[test]
fn test_cache_stays_within_budget() {
    let cache: ResultCache<u32, Vec<u32>> = ResultCache::new(2048, 60_000);
    let mut rng = StdRng::seed_from_u64(5);

    for i in 0..500u32 {
        let len = rng.gen_range(0..120);
        let value: Vec<u32> = (0..len).map(|_| rng.gen()).collect();
        cache.set(i % 64, value);
        assert!(cache.used_bytes() <= cache.budget_bytes());
    }
    assert!(cache.stats().evictions > 0);
}
