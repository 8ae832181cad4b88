/// Partition table of one category.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use serde::{Deserialize, Serialize};
use crate::index::SlotId;

pub type PartitionId = u64;

/// A bounded group of slots routed to by centroid similarity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub category: String,
    pub centroid: Vec<f32>,
    pub members: BTreeSet<SlotId>,
    pub created_at: u64,
    pub last_updated: u64,
}

impl Partition {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub partitions: BTreeMap<PartitionId, Partition>,
    pub assignments: HashMap<SlotId, PartitionId>,
    pub next_id: PartitionId,
}

impl PartitionTable {
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn partition_of(&self, slot: SlotId) -> Option<PartitionId> {
        self.assignments.get(&slot).copied()
    }

    pub(crate) fn allocate_id(&mut self) -> PartitionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert_partition(&mut self, partition: Partition) {
        for &slot in &partition.members {
            self.assignments.insert(slot, partition.id);
        }
        self.partitions.insert(partition.id, partition);
    }

    pub(crate) fn remove_partition(&mut self, id: PartitionId) -> Option<Partition> {
        let partition = self.partitions.remove(&id)?;
        for slot in &partition.members {
            if self.assignments.get(slot) == Some(&id) {
                self.assignments.remove(slot);
            }
        }
        Some(partition)
    }

    /// Members and the assignment map agree, and no partition is empty.
    pub fn is_consistent(&self) -> bool {
        let member_total: usize = self.partitions.values().map(Partition::size).sum();
        member_total == self.assignments.len()
            && self.partitions.values().all(|p| {
                !p.members.is_empty()
                    && p.members.iter().all(|slot| self.assignments.get(slot) == Some(&p.id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(id: PartitionId, members: &[SlotId]) -> Partition {
        Partition {
            id,
            category: "episodic".to_string(),
            centroid: vec![0.0],
            members: members.iter().copied().collect(),
            created_at: 0,
            last_updated: 0,
        }
    }

    #[test]
    fn test_insert_and_remove_partition() {
        let mut table = PartitionTable::default();
        let id = table.allocate_id();
        table.insert_partition(partition(id, &[1, 2, 3]));
        assert_eq!(table.partition_of(2), Some(id));
        assert!(table.is_consistent());

        let removed = table.remove_partition(id).unwrap();
        assert_eq!(removed.size(), 3);
        assert!(table.assignments.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_empty_partition_is_inconsistent() {
        let mut table = PartitionTable::default();
        table.insert_partition(partition(0, &[]));
        assert!(!table.is_consistent());
    }
}
