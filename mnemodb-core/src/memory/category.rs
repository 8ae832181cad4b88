/// Per-category state.
///
/// Locking:
/// - `writer` serializes every mutation of the category (insert, archive,
///   merge/split, publishing a pass result). Take it before any other lock.
/// - Then records, index, slots, archive, in that order.
/// - Cluster and partition tables are published as whole `Arc` snapshots;
///   their locks are only held to clone or swap the pointer.
/// - `activity` makes clustering, rebalancing and maintenance mutually
///   exclusive. Entering a busy category fails instead of waiting.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use crate::clustering::{ClusterId, ClusterTable};
use crate::core::errors::{MnemoError, Result};
use crate::index::{SlotId, VectorIndex};
use crate::memory::record::{ArchivedRecord, MemoryRecord, SlotMetadata};
use crate::partition::PartitionTable;
use crate::storage::CategorySection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CategoryActivity {
    Idle = 0,
    Clustering = 1,
    Rebalancing = 2,
    Maintaining = 3,
}

impl CategoryActivity {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CategoryActivity::Clustering,
            2 => CategoryActivity::Rebalancing,
            3 => CategoryActivity::Maintaining,
            _ => CategoryActivity::Idle,
        }
    }
}

impl fmt::Display for CategoryActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryActivity::Idle => write!(f, "idle"),
            CategoryActivity::Clustering => write!(f, "clustering"),
            CategoryActivity::Rebalancing => write!(f, "rebalancing"),
            CategoryActivity::Maintaining => write!(f, "maintaining"),
        }
    }
}

/// Live records, by slot and by memory id.
#[derive(Debug, Default)]
pub(crate) struct RecordTable {
    pub by_slot: HashMap<SlotId, MemoryRecord>,
    pub slot_of: HashMap<String, SlotId>,
}

impl RecordTable {
    pub fn len(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    pub fn insert(&mut self, slot: SlotId, record: MemoryRecord) {
        self.slot_of.insert(record.id.clone(), slot);
        self.by_slot.insert(slot, record);
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<MemoryRecord> {
        let record = self.by_slot.remove(&slot)?;
        self.slot_of.remove(&record.id);
        Some(record)
    }

    pub fn get_by_id(&self, memory_id: &str) -> Option<&MemoryRecord> {
        self.slot_of.get(memory_id).and_then(|slot| self.by_slot.get(slot))
    }

    pub fn get_mut_by_id(&mut self, memory_id: &str) -> Option<&mut MemoryRecord> {
        let slot = *self.slot_of.get(memory_id)?;
        self.by_slot.get_mut(&slot)
    }

    pub fn touch(&mut self, memory_id: &str, now: u64) {
        if let Some(record) = self.get_mut_by_id(memory_id) {
            record.touch(now);
        }
    }

    pub fn average_strength(&self) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let total: f32 = self.by_slot.values().map(|r| r.strength).sum();
        Some(total / self.by_slot.len() as f32)
    }
}

/// Inserts since the last clustering pass.
#[derive(Debug, Default)]
pub(crate) struct PendingWork {
    pub inserts: usize,
    pub touched: BTreeSet<ClusterId>,
    pub last_pass_ms: u64,
}

pub(crate) struct CategoryState {
    pub name: String,
    pub dimension: usize,
    pub index: RwLock<Box<dyn VectorIndex>>,
    pub records: RwLock<RecordTable>,
    pub slots: RwLock<HashMap<SlotId, SlotMetadata>>,
    pub archive: RwLock<HashMap<String, ArchivedRecord>>,
    clusters: RwLock<Arc<ClusterTable>>,
    partitions: RwLock<Arc<PartitionTable>>,
    pub writer: Mutex<()>,
    activity: AtomicU8,
    /// Bumped by explicit merge/split; a pass that saw another value
    /// discards its result
    pub cluster_epoch: AtomicU64,
    /// Bumped on every change visible to queries; part of cache keys
    pub generation: AtomicU64,
    pub pending: Mutex<PendingWork>,
}

/// Holds a category's activity slot; releases it on drop.
pub(crate) struct ActivityGuard {
    state: Arc<CategoryState>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.state.activity.store(CategoryActivity::Idle as u8, Ordering::Release);
    }
}

impl CategoryState {
    pub fn new(name: &str, index: Box<dyn VectorIndex>, now: u64) -> Self {
        CategoryState {
            name: name.to_string(),
            dimension: index.dimension(),
            index: RwLock::new(index),
            records: RwLock::new(RecordTable::default()),
            slots: RwLock::new(HashMap::new()),
            archive: RwLock::new(HashMap::new()),
            clusters: RwLock::new(Arc::new(ClusterTable::default())),
            partitions: RwLock::new(Arc::new(PartitionTable::default())),
            writer: Mutex::new(()),
            activity: AtomicU8::new(CategoryActivity::Idle as u8),
            cluster_epoch: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            pending: Mutex::new(PendingWork {
                last_pass_ms: now,
                ..PendingWork::default()
            }),
        }
    }

    /// Enter `activity` if the category is idle.
    pub fn try_begin(self: &Arc<Self>, activity: CategoryActivity) -> Option<ActivityGuard> {
        self.activity
            .compare_exchange(
                CategoryActivity::Idle as u8,
                activity as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| ActivityGuard { state: self.clone() })
    }

    pub fn activity(&self) -> CategoryActivity {
        CategoryActivity::from_u8(self.activity.load(Ordering::Acquire))
    }

    pub fn cluster_snapshot(&self) -> Arc<ClusterTable> {
        self.clusters.read().clone()
    }

    pub fn publish_clusters(&self, table: ClusterTable) {
        *self.clusters.write() = Arc::new(table);
    }

    pub fn partition_snapshot(&self) -> Arc<PartitionTable> {
        self.partitions.read().clone()
    }

    pub fn publish_partitions(&self, table: PartitionTable) {
        *self.partitions.write() = Arc::new(table);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Copy of the live records, for passes that run off-lock.
    pub fn live_records(&self) -> HashMap<SlotId, MemoryRecord> {
        self.records.read().by_slot.clone()
    }

    /// Snapshot for persistence. Callers hold `writer`.
    pub fn to_section(&self, index_file: String, index_generation: u64, now: u64) -> CategorySection {
        let mut archive: Vec<ArchivedRecord> = self.archive.read().values().cloned().collect();
        archive.sort_by_key(|a| a.slot);
        CategorySection {
            dimension: self.dimension,
            index_file,
            index_generation,
            slots: self.slots.read().iter().map(|(&s, m)| (s, m.clone())).collect(),
            records: self.records.read().by_slot.iter().map(|(&s, r)| (s, r.clone())).collect(),
            archive,
            clusters: (*self.cluster_snapshot()).clone(),
            partitions: (*self.partition_snapshot()).clone(),
            saved_at: now,
        }
    }

    /// Rebuild a category from a saved section and its restored index.
    /// Rejects sections whose tables disagree with each other or with the
    /// index.
    pub fn from_section(
        name: &str,
        section: CategorySection,
        index: Box<dyn VectorIndex>,
        now: u64,
    ) -> Result<Self> {
        let corrupt = |what: &str| {
            MnemoError::PersistenceFailure(format!("category {}: {}", name, what))
        };

        if index.dimension() != section.dimension {
            return Err(corrupt("index dimension differs from metadata"));
        }
        if index.count() != section.slots.len() {
            return Err(corrupt("index slot count differs from slot table"));
        }

        let mut records = RecordTable::default();
        for (slot, record) in section.records {
            let Some(meta) = section.slots.get(&slot) else {
                return Err(corrupt("record without slot metadata"));
            };
            if meta.memory_id != record.id || index.is_tombstoned(slot) {
                return Err(corrupt("record does not match its slot"));
            }
            if record.vector.len() != section.dimension {
                return Err(corrupt("record vector has wrong dimension"));
            }
            if records.slot_of.contains_key(&record.id) {
                return Err(corrupt("duplicate memory id"));
            }
            records.insert(slot, record);
        }

        let covers_live = |assigned: &HashMap<SlotId, u64>| {
            assigned.len() == records.len() && assigned.keys().all(|s| records.by_slot.contains_key(s))
        };
        if !section.clusters.is_consistent() || !covers_live(&section.clusters.assignments) {
            return Err(corrupt("cluster table does not cover the live records"));
        }
        if !section.partitions.is_consistent() || !covers_live(&section.partitions.assignments) {
            return Err(corrupt("partition table does not cover the live records"));
        }

        let state = CategoryState::new(name, index, now);
        *state.records.write() = records;
        *state.slots.write() = section.slots.into_iter().collect();
        *state.archive.write() = section
            .archive
            .into_iter()
            .map(|a| (a.record.id.clone(), a))
            .collect();
        state.publish_clusters(section.clusters);
        state.publish_partitions(section.partitions);
        Ok(state)
    }
}
