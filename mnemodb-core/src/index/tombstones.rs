/// TombstoneSet: slot deletion without touching the graph
///
/// Archived vectors are never physically removed from the index. Their
/// slot is marked as tombstoned: searches still traverse the node (so the
/// graph stays connected) but never return it, and the slot id is never
/// handed out again, which keeps slot metadata stable.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use crate::core::utils::current_timestamp_ms;
use crate::index::SlotId;

/// Reason for tombstoning a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TombstoneReason {
    /// Strength decayed to the floor
    Decayed,

    /// Folded into another record during consolidation
    Consolidated,

    /// Removed explicitly by a caller
    Removed,
}

/// A single tombstone entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub slot: SlotId,
    pub reason: TombstoneReason,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TombstoneSet {
    entries: HashMap<SlotId, TombstoneEntry>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        TombstoneSet::default()
    }

    /// Mark a slot as deleted. Re-tombstoning keeps the first entry.
    pub fn tombstone(&mut self, slot: SlotId, reason: TombstoneReason) {
        self.entries.entry(slot).or_insert_with(|| TombstoneEntry {
            slot,
            reason,
            timestamp: current_timestamp_ms(),
        });
    }

    #[inline]
    pub fn is_tombstoned(&self, slot: SlotId) -> bool {
        self.entries.contains_key(&slot)
    }

    pub fn get(&self, slot: SlotId) -> Option<&TombstoneEntry> {
        self.entries.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by slot (for snapshots).
    pub fn entries(&self) -> Vec<TombstoneEntry> {
        let mut all: Vec<_> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.slot);
        all
    }

    pub fn from_entries(entries: Vec<TombstoneEntry>) -> Self {
        TombstoneSet {
            entries: entries.into_iter().map(|e| (e.slot, e)).collect(),
        }
    }
}
