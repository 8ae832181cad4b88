/// Nearest-neighbor index boundary.
///
/// The store talks to one `VectorIndex` per category. Any index that
/// honors this contract can be registered; `HnswIndex` is the bundled
/// implementation.

pub mod hnsw;
pub mod tombstones;

use std::collections::HashSet;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::core::errors::Result;

pub use hnsw::HnswIndex;
pub use tombstones::{TombstoneEntry, TombstoneReason, TombstoneSet};

/// Index-internal identifier of one stored vector. Slots are dense and
/// never reused.
pub type SlotId = usize;

/// One search hit: slot and cosine distance to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub slot: SlotId,
    pub distance: f32,
}

impl IndexHit {
    /// Cosine similarity derived from the distance.
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

pub trait VectorIndex: Send + Sync {
    /// Fixed vector length of this index.
    fn dimension(&self) -> usize;

    /// Store a vector and return its slot.
    fn insert(&mut self, vector: &[f32]) -> Result<SlotId>;

    /// Top-k live slots nearest to `query`, ascending by distance.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>>;

    /// Top-k live slots restricted to `allowed`.
    fn search_within(
        &self,
        query: &[f32],
        k: usize,
        allowed: &HashSet<SlotId>,
    ) -> Result<Vec<IndexHit>> {
        let mut hits = self.search(query, self.count())?;
        hits.retain(|hit| allowed.contains(&hit.slot));
        hits.truncate(k);
        Ok(hits)
    }

    /// Stored vector of a slot, tombstoned or not.
    fn get(&self, slot: SlotId) -> Option<Vec<f32>>;

    /// Number of slots ever inserted (tombstones included).
    fn count(&self) -> usize;

    /// Exclude a slot from future results. The slot id is not reused.
    fn tombstone(&mut self, slot: SlotId, reason: TombstoneReason) -> Result<()>;

    fn is_tombstoned(&self, slot: SlotId) -> bool;

    /// Write the whole index to `path`.
    fn persist(&self, path: &Path) -> Result<()>;

    /// Replace the in-memory state with the index stored at `path`.
    /// Fails if the stored index holds more than `capacity` slots.
    fn restore(&mut self, path: &Path, capacity: usize) -> Result<()>;
}
