/// PartitionManager: routing and rebalancing of partitions
///
/// Responsibilities:
/// 1. Route a new slot to the most similar partition with room
/// 2. Pick the partitions a query should search (fail open)
/// 3. Split oversized and merge undersized partitions
/// 4. Reconcile an off-lock rebalance with slots inserted meanwhile

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};
use crate::clustering::kmeans::two_means_split;
use crate::core::config::PartitionConfig;
use crate::index::SlotId;
use crate::memory::record::MemoryRecord;
use crate::partition::table::{Partition, PartitionId, PartitionTable};
use crate::vector::distance::{centroid_of, cosine_similarity, weighted_mean};

const SPLIT_MAX_ITERATIONS: usize = 25;

/// Where a new slot should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionChoice {
    Existing(PartitionId),
    New,
}

/// Result of one rebalance pass
#[derive(Debug, Clone, Default)]
pub struct RebalanceOutcome {
    /// New table, or `None` when nothing changed or the pass was cancelled
    pub table: Option<PartitionTable>,
    pub splits: usize,
    pub merges: usize,
    pub cancelled: bool,
}

pub struct PartitionManager {
    config: PartitionConfig,
    rng: Mutex<StdRng>,
    cancel: Arc<AtomicBool>,
}

impl PartitionManager {
    pub fn new(config: PartitionConfig, seed: u64) -> Self {
        PartitionManager {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Most similar partition that has room and clears the similarity
    /// threshold. Ties go to the lowest id.
    pub fn optimal_partition(&self, table: &PartitionTable, vector: &[f32]) -> PartitionChoice {
        let mut best: Option<(PartitionId, f32)> = None;
        for (&id, partition) in &table.partitions {
            if partition.size() >= self.config.max_partition_size {
                continue;
            }
            let sim = cosine_similarity(vector, &partition.centroid);
            if sim <= self.config.similarity_threshold {
                continue;
            }
            match best {
                Some((_, best_sim)) if sim <= best_sim => {}
                _ => best = Some((id, sim)),
            }
        }
        match best {
            Some((id, _)) => PartitionChoice::Existing(id),
            None => PartitionChoice::New,
        }
    }

    /// Place a slot, creating a partition when no existing one qualifies.
    pub fn assign_slot(
        &self,
        table: &PartitionTable,
        category: &str,
        slot: SlotId,
        vector: &[f32],
        now: u64,
    ) -> (PartitionTable, PartitionId) {
        let mut next = table.clone();
        let id = Self::place(&mut next, self.optimal_partition(table, vector), category, slot, vector, now);
        (next, id)
    }

    fn place(
        table: &mut PartitionTable,
        choice: PartitionChoice,
        category: &str,
        slot: SlotId,
        vector: &[f32],
        now: u64,
    ) -> PartitionId {
        match choice {
            PartitionChoice::Existing(id) => {
                if let Some(partition) = table.partitions.get_mut(&id) {
                    partition.centroid = weighted_mean(&partition.centroid, partition.size(), vector, 1);
                    partition.members.insert(slot);
                    partition.last_updated = now;
                }
                table.assignments.insert(slot, id);
                id
            }
            PartitionChoice::New => {
                let id = table.allocate_id();
                table.insert_partition(Partition {
                    id,
                    category: category.to_string(),
                    centroid: vector.to_vec(),
                    members: BTreeSet::from([slot]),
                    created_at: now,
                    last_updated: now,
                });
                id
            }
        }
    }

    /// Partitions whose centroid similarity to the query exceeds the
    /// threshold, most similar first. Falls back to every partition when
    /// none qualifies.
    pub fn relevant_partitions(&self, table: &PartitionTable, query: &[f32]) -> Vec<PartitionId> {
        let mut scored: Vec<(PartitionId, f32)> = table
            .partitions
            .iter()
            .map(|(&id, p)| (id, cosine_similarity(query, &p.centroid)))
            .filter(|(_, sim)| *sim > self.config.similarity_threshold)
            .collect();

        if scored.is_empty() {
            return table.partitions.keys().copied().collect();
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    /// Split every partition above `max_partition_size`, then merge
    /// partitions below `min_partition_size` into their most similar
    /// neighbor while the merged size stays within the maximum. Repeats
    /// until nothing changes, so a second call on the result is a no-op.
    pub fn rebalance(
        &self,
        table: &PartitionTable,
        records: &HashMap<SlotId, MemoryRecord>,
        now: u64,
    ) -> RebalanceOutcome {
        let mut next = table.clone();
        let mut outcome = RebalanceOutcome::default();
        let mut rng = StdRng::seed_from_u64(self.rng.lock().gen());

        // Splits
        let mut queue: Vec<PartitionId> = next
            .partitions
            .values()
            .filter(|p| p.size() > self.config.max_partition_size)
            .map(|p| p.id)
            .collect();

        while let Some(id) = queue.pop() {
            if self.cancel.load(Ordering::Acquire) {
                outcome.cancelled = true;
                return outcome;
            }
            let Some(oversized) = next.remove_partition(id) else { continue };
            let members: Vec<SlotId> = oversized.members.iter().copied().collect();
            let points: Vec<&[f32]> = members
                .iter()
                .filter_map(|s| records.get(s).map(|r| r.vector.as_slice()))
                .collect();
            if points.len() != members.len() {
                // Stale members; reconcile will settle them
                next.insert_partition(oversized);
                continue;
            }

            let Some((left, right)) = two_means_split(&points, SPLIT_MAX_ITERATIONS, &mut rng, &self.cancel) else {
                outcome.cancelled = true;
                return outcome;
            };
            for side in [left, right] {
                let side_members: BTreeSet<SlotId> = side.iter().map(|&i| members[i]).collect();
                let centroid = centroid_of(side.iter().map(|&i| points[i])).unwrap_or_default();
                let part_id = next.allocate_id();
                let size = side_members.len();
                next.insert_partition(Partition {
                    id: part_id,
                    category: oversized.category.clone(),
                    centroid,
                    members: side_members,
                    created_at: now,
                    last_updated: now,
                });
                if size > self.config.max_partition_size {
                    queue.push(part_id);
                }
            }
            outcome.splits += 1;
        }

        // Merges, smallest first, until no undersized partition has a target
        loop {
            if self.cancel.load(Ordering::Acquire) {
                outcome.cancelled = true;
                return outcome;
            }
            let Some((source, target)) = self.next_merge(&next) else { break };
            let Some(small) = next.remove_partition(source) else { break };
            if let Some(large) = next.partitions.get_mut(&target) {
                large.centroid = weighted_mean(&large.centroid, large.size(), &small.centroid, small.size());
                large.members.extend(small.members.iter().copied());
                large.last_updated = now;
            }
            for slot in small.members {
                next.assignments.insert(slot, target);
            }
            outcome.merges += 1;
        }

        if outcome.splits > 0 || outcome.merges > 0 {
            info!(
                splits = outcome.splits,
                merges = outcome.merges,
                partitions = next.len(),
                "Partition rebalance computed"
            );
            outcome.table = Some(next);
        }
        outcome
    }

    fn next_merge(&self, table: &PartitionTable) -> Option<(PartitionId, PartitionId)> {
        let mut undersized: Vec<&Partition> = table
            .partitions
            .values()
            .filter(|p| p.size() < self.config.min_partition_size)
            .collect();
        undersized.sort_by_key(|p| (p.size(), p.id));

        for small in undersized {
            let mut best: Option<(PartitionId, f32)> = None;
            for (&id, other) in &table.partitions {
                if id == small.id || small.size() + other.size() > self.config.max_partition_size {
                    continue;
                }
                let sim = cosine_similarity(&small.centroid, &other.centroid);
                if sim <= self.config.similarity_threshold {
                    continue;
                }
                match best {
                    Some((_, best_sim)) if sim <= best_sim => {}
                    _ => best = Some((id, sim)),
                }
            }
            if let Some((target, _)) = best {
                return Some((small.id, target));
            }
        }
        None
    }

    /// Drop slots from their partitions. Emptied partitions are removed;
    /// the others get their centroid recomputed over the members still
    /// present in `records`.
    pub fn remove_slots(
        &self,
        table: &PartitionTable,
        slots: &[SlotId],
        records: &HashMap<SlotId, MemoryRecord>,
        now: u64,
    ) -> PartitionTable {
        let mut next = table.clone();
        let mut touched = BTreeSet::new();
        for slot in slots {
            let Some(id) = next.assignments.remove(slot) else { continue };
            let emptied = match next.partitions.get_mut(&id) {
                Some(partition) => {
                    partition.members.remove(slot);
                    partition.last_updated = now;
                    partition.members.is_empty()
                }
                None => false,
            };
            if emptied {
                next.partitions.remove(&id);
                touched.remove(&id);
            } else {
                touched.insert(id);
            }
        }

        for id in touched {
            let Some(partition) = next.partitions.get_mut(&id) else { continue };
            let remaining = partition
                .members
                .iter()
                .filter_map(|s| records.get(s).map(|r| r.vector.as_slice()));
            if let Some(centroid) = centroid_of(remaining) {
                partition.centroid = centroid;
            }
        }
        next
    }

    /// Bring a table computed from an older snapshot up to date: slots
    /// no longer live are dropped, live slots it lacks are routed as new.
    pub fn reconcile(
        &self,
        computed: PartitionTable,
        latest: &PartitionTable,
        records: &HashMap<SlotId, MemoryRecord>,
        category: &str,
        now: u64,
    ) -> PartitionTable {
        let stale: Vec<SlotId> = computed
            .assignments
            .keys()
            .filter(|slot| !records.contains_key(slot))
            .copied()
            .collect();
        let mut next = self.remove_slots(&computed, &stale, records, now);
        next.next_id = next.next_id.max(latest.next_id);

        let mut missing: Vec<SlotId> = records
            .keys()
            .filter(|slot| !next.assignments.contains_key(slot))
            .copied()
            .collect();
        missing.sort_unstable();
        for slot in missing {
            let vector = &records[&slot].vector;
            let choice = self.optimal_partition(&next, vector);
            Self::place(&mut next, choice, category, slot, vector, now);
        }

        if !stale.is_empty() {
            debug!(category, dropped = stale.len(), "Reconciled partition table");
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RecordDefaults;
    use crate::memory::record::NewMemory;

    fn config(max: usize, min: usize) -> PartitionConfig {
        PartitionConfig {
            max_partition_size: max,
            min_partition_size: min,
            similarity_threshold: 0.7,
        }
    }

    fn record(vector: Vec<f32>) -> MemoryRecord {
        NewMemory::new("episodic", vector).into_record(&RecordDefaults::default())
    }

    fn fill(manager: &PartitionManager, vectors: &[Vec<f32>]) -> (PartitionTable, HashMap<SlotId, MemoryRecord>) {
        let mut table = PartitionTable::default();
        let mut records = HashMap::new();
        for (slot, v) in vectors.iter().enumerate() {
            let (next, _) = manager.assign_slot(&table, "episodic", slot, v, 0);
            table = next;
            records.insert(slot, record(v.clone()));
        }
        (table, records)
    }

    #[test]
    fn test_routing_creates_and_reuses_partitions() {
        let manager = PartitionManager::new(config(10, 0), 1);
        let (table, _) = fill(&manager, &[vec![1.0, 0.0], vec![0.9, 0.1], vec![0.0, 1.0]]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.partition_of(0), table.partition_of(1));
        assert_ne!(table.partition_of(0), table.partition_of(2));
        assert!(table.is_consistent());
    }

    #[test]
    fn test_full_partition_is_skipped() {
        let manager = PartitionManager::new(config(2, 0), 1);
        let (table, _) = fill(&manager, &[vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]]);
        assert_eq!(table.len(), 2);
        assert!(table.partitions.values().all(|p| p.size() <= 2));
    }

    #[test]
    fn test_relevant_partitions_fail_open() {
        let manager = PartitionManager::new(config(10, 0), 1);
        let (table, _) = fill(&manager, &[vec![1.0, 0.0], vec![0.0, 1.0]]);

        let relevant = manager.relevant_partitions(&table, &[1.0, 0.0]);
        assert_eq!(relevant, vec![table.partition_of(0).unwrap()]);

        let everything = manager.relevant_partitions(&table, &[-1.0, -1.0]);
        assert_eq!(everything.len(), 2);
        assert!(manager.relevant_partitions(&PartitionTable::default(), &[1.0, 0.0]).is_empty());
    }

    #[test]
    fn test_rebalance_splits_oversized() {
        let routing = PartitionManager::new(config(100, 0), 1);
        let mut vectors = Vec::new();
        for i in 0..6 {
            vectors.push(vec![1.0, 0.01 * i as f32]);
            vectors.push(vec![0.75, 0.7 + 0.01 * i as f32]);
        }
        let (table, records) = fill(&routing, &vectors);
        assert_eq!(table.len(), 1);

        let manager = PartitionManager::new(config(4, 0), 1);
        let outcome = manager.rebalance(&table, &records, 10);
        let rebalanced = outcome.table.unwrap();
        assert!(outcome.splits >= 2);
        assert!(rebalanced.is_consistent());
        assert!(rebalanced.partitions.values().all(|p| p.size() <= 4));
        assert_eq!(rebalanced.assignments.len(), 12);
    }

    #[test]
    fn test_rebalance_merges_undersized_and_is_idempotent() {
        let manager = PartitionManager::new(config(10, 3), 1);
        let mut table = PartitionTable::default();
        let mut records = HashMap::new();
        for slot in 0..4 {
            let v = vec![1.0, 0.01 * slot as f32];
            records.insert(slot, record(v.clone()));
            let id = table.allocate_id();
            table.insert_partition(Partition {
                id,
                category: "episodic".to_string(),
                centroid: v,
                members: BTreeSet::from([slot]),
                created_at: 0,
                last_updated: 0,
            });
        }

        let first = manager.rebalance(&table, &records, 5);
        let merged = first.table.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(first.merges, 3);
        assert!(merged.is_consistent());

        let second = manager.rebalance(&merged, &records, 6);
        assert!(second.table.is_none());
        assert_eq!(second.splits + second.merges, 0);
    }

    #[test]
    fn test_remove_slots_drops_empty_partitions() {
        let manager = PartitionManager::new(config(10, 0), 1);
        let (table, _) = fill(&manager, &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let next = manager.remove_slots(&table, &[1], &HashMap::new(), 3);
        assert_eq!(next.len(), 1);
        assert_eq!(next.partition_of(1), None);
        assert!(next.is_consistent());
    }

    #[test]
    fn test_remove_slots_recomputes_centroid() {
        let manager = PartitionManager::new(config(20, 0), 1);
        let mut vectors = vec![vec![1.0, 0.9]; 10];
        vectors.push(vec![1.0, 0.1]);
        let (table, mut records) = fill(&manager, &vectors);
        assert_eq!(table.len(), 1);

        let removed: Vec<SlotId> = (0..10).collect();
        for slot in &removed {
            records.remove(slot);
        }
        let next = manager.remove_slots(&table, &removed, &records, 4);
        assert_eq!(next.len(), 1);
        let partition = next.partitions.values().next().unwrap();
        assert_eq!(partition.members, BTreeSet::from([10]));
        assert_eq!(partition.centroid, vec![1.0, 0.1]);
        assert_eq!(partition.last_updated, 4);
    }

    #[test]
    fn test_reconcile_routes_new_slots() {
        let manager = PartitionManager::new(config(10, 0), 1);
        let (table, mut records) = fill(&manager, &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        records.remove(&0);
        records.insert(2, record(vec![0.1, 0.9]));

        let reconciled = manager.reconcile(table.clone(), &table, &records, "episodic", 9);
        assert!(reconciled.is_consistent());
        assert_eq!(reconciled.partition_of(0), None);
        assert_eq!(reconciled.partition_of(2), reconciled.partition_of(1));
    }
}
