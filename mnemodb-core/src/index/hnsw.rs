/// HNSW index over cosine distance.
///
/// Layered proximity graph: every node lives on layer 0 and, with
/// exponentially decreasing probability, on higher layers. Search
/// descends greedily from the entry point through the upper layers and
/// finishes with an ef-bounded best-first search on layer 0.
///
/// Tombstoned slots stay in the graph as routing nodes but are filtered
/// out of every result set.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::core::config::IndexConfig;
use crate::core::errors::{MnemoError, Result};
use crate::index::{IndexHit, SlotId, TombstoneEntry, TombstoneReason, TombstoneSet, VectorIndex};
use crate::vector::distance::cosine_distance;

const MAX_LEVEL: usize = 16;

/// HNSW graph layer representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer {
    /// Adjacency list: node_id -> neighbor node_ids
    pub graph: HashMap<usize, Vec<usize>>,
}

impl Layer {
    /// Neighbors of a node (empty if the node is not on this layer).
    pub fn neighbors(&self, node: usize) -> &[usize] {
        self.graph.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn contains_node(&self, node: usize) -> bool {
        self.graph.contains_key(&node)
    }

    pub fn size(&self) -> usize {
        self.graph.len()
    }
}

/// Heap entry ordered by distance, then node id.
#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    distance: f32,
    node_id: usize,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// On-disk form of the whole index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HnswSnapshot {
    dimension: usize,
    config: IndexConfig,
    vectors: Vec<Vec<f32>>,
    levels: Vec<usize>,
    layers: Vec<Layer>,
    entry_point: Option<usize>,
    tombstones: Vec<TombstoneEntry>,
}

pub struct HnswIndex {
    dimension: usize,
    config: IndexConfig,
    m_l: f32,
    vectors: Vec<Vec<f32>>,
    /// Top layer of each node
    levels: Vec<usize>,
    layers: Vec<Layer>,
    entry_point: Option<usize>,
    tombstones: TombstoneSet,
    rng: StdRng,
}

impl HnswIndex {
    pub fn new(dimension: usize, config: IndexConfig) -> Self {
        let m_l = 1.0 / (config.m.max(2) as f32).ln();
        let rng = StdRng::seed_from_u64(config.seed);
        HnswIndex {
            dimension,
            config,
            m_l,
            vectors: Vec::new(),
            levels: Vec::new(),
            layers: vec![Layer::default()],
            entry_point: None,
            tombstones: TombstoneSet::new(),
            rng,
        }
    }

    /// Index with default parameters (M=16, ef_construction=100, ef_search=50).
    pub fn with_defaults(dimension: usize) -> Self {
        HnswIndex::new(dimension, IndexConfig::default())
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MnemoError::VectorDimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Assign level for a new node using exponential distribution.
    fn assign_level(&mut self) -> usize {
        let u: f32 = self.rng.gen_range(f32::EPSILON..1.0);
        ((-u.ln() * self.m_l).floor() as usize).min(MAX_LEVEL)
    }

    #[inline]
    fn distance(&self, query: &[f32], node: usize) -> f32 {
        cosine_distance(query, &self.vectors[node])
    }

    /// Greedy walk to the closest node on one layer.
    fn greedy_closest(&self, query: &[f32], entry: usize, layer: usize) -> usize {
        let mut current = entry;
        let mut current_dist = self.distance(query, current);
        loop {
            let mut improved = false;
            for &neighbor in self.layers[layer].neighbors(current) {
                let dist = self.distance(query, neighbor);
                if dist < current_dist {
                    current_dist = dist;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search on one layer keeping the `ef` closest accepted
    /// nodes. Rejected nodes are still expanded so filters never cut the
    /// graph. Result is ascending by distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
        accept: &dyn Fn(usize) -> bool,
    ) -> Vec<HeapEntry> {
        let ef = ef.max(1);
        let mut visited = HashSet::new();
        visited.insert(entry);

        let start = HeapEntry {
            distance: self.distance(query, entry),
            node_id: entry,
        };
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse(start));
        let mut results: BinaryHeap<HeapEntry> = BinaryHeap::new();
        if accept(entry) {
            results.push(start);
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(farthest) = results.peek() {
                    if current.distance > farthest.distance {
                        break;
                    }
                }
            }

            for &neighbor in self.layers[layer].neighbors(current.node_id) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let entry = HeapEntry {
                    distance: self.distance(query, neighbor),
                    node_id: neighbor,
                };
                let admit = results.len() < ef
                    || results.peek().map_or(true, |farthest| entry.distance < farthest.distance);
                if admit {
                    candidates.push(Reverse(entry));
                    if accept(neighbor) {
                        results.push(entry);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Add `to` to the adjacency of `from`, pruning to the `m_max` closest.
    fn connect(&mut self, from: usize, to: usize, layer: usize, m_max: usize) {
        let vectors = &self.vectors;
        let list = self.layers[layer].graph.entry(from).or_default();
        if list.contains(&to) {
            return;
        }
        list.push(to);
        if list.len() > m_max {
            let base = &vectors[from];
            let mut scored: Vec<(f32, usize)> = list
                .iter()
                .map(|&n| (cosine_distance(base, &vectors[n]), n))
                .collect();
            scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)));
            scored.truncate(m_max);
            *list = scored.into_iter().map(|(_, n)| n).collect();
        }
    }

    fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(usize) -> bool,
    ) -> Result<Vec<IndexHit>> {
        self.check_dimension(query)?;
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut current = entry;
        for layer in (1..=self.levels[entry]).rev() {
            current = self.greedy_closest(query, current, layer);
        }

        let ef = self.config.ef_search.max(k);
        Ok(self
            .search_layer(query, current, ef, 0, accept)
            .into_iter()
            .take(k)
            .map(|e| IndexHit {
                slot: e.node_id,
                distance: e.distance,
            })
            .collect())
    }
}

impl VectorIndex for HnswIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn insert(&mut self, vector: &[f32]) -> Result<SlotId> {
        self.check_dimension(vector)?;

        let slot = self.vectors.len();
        self.vectors.push(vector.to_vec());
        let level = self.assign_level();
        self.levels.push(level);
        while self.layers.len() <= level {
            self.layers.push(Layer::default());
        }
        for layer in 0..=level {
            self.layers[layer].graph.entry(slot).or_default();
        }

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            return Ok(slot);
        };

        let top = self.levels[entry];
        let mut current = entry;
        for layer in ((level + 1)..=top).rev() {
            current = self.greedy_closest(vector, current, layer);
        }

        let ef = self.config.ef_construction.max(self.config.m);
        for layer in (0..=level.min(top)).rev() {
            let candidates = self.search_layer(vector, current, ef, layer, &|n| n != slot);
            let m_max = if layer == 0 { self.config.m * 2 } else { self.config.m };
            let selected: Vec<usize> = candidates
                .iter()
                .take(self.config.m)
                .map(|c| c.node_id)
                .collect();
            for &neighbor in &selected {
                self.connect(slot, neighbor, layer, m_max);
                self.connect(neighbor, slot, layer, m_max);
            }
            if let Some(best) = candidates.first() {
                current = best.node_id;
            }
        }

        if level > top {
            self.entry_point = Some(slot);
        }

        debug!(slot, level, "HNSW: inserted vector");
        Ok(slot)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        self.search_filtered(query, k, &|slot| !self.tombstones.is_tombstoned(slot))
    }

    fn search_within(
        &self,
        query: &[f32],
        k: usize,
        allowed: &HashSet<SlotId>,
    ) -> Result<Vec<IndexHit>> {
        if allowed.is_empty() {
            return Ok(Vec::new());
        }
        self.search_filtered(query, k, &|slot| {
            allowed.contains(&slot) && !self.tombstones.is_tombstoned(slot)
        })
    }

    fn get(&self, slot: SlotId) -> Option<Vec<f32>> {
        self.vectors.get(slot).cloned()
    }

    fn count(&self) -> usize {
        self.vectors.len()
    }

    fn tombstone(&mut self, slot: SlotId, reason: TombstoneReason) -> Result<()> {
        if slot >= self.vectors.len() {
            return Err(MnemoError::NotFound(format!("slot {}", slot)));
        }
        self.tombstones.tombstone(slot, reason);
        Ok(())
    }

    fn is_tombstoned(&self, slot: SlotId) -> bool {
        self.tombstones.is_tombstoned(slot)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let snapshot = HnswSnapshot {
            dimension: self.dimension,
            config: self.config.clone(),
            vectors: self.vectors.clone(),
            levels: self.levels.clone(),
            layers: self.layers.clone(),
            entry_point: self.entry_point,
            tombstones: self.tombstones.entries(),
        };

        let tmp_path = path.with_extension("tmp");
        let file = File::create(&tmp_path)
            .map_err(|e| MnemoError::persistence("Failed to create index file", e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &snapshot)
            .map_err(|e| MnemoError::persistence("Failed to serialize index", e))?;
        writer
            .flush()
            .map_err(|e| MnemoError::persistence("Failed to flush index file", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| MnemoError::persistence("Failed to sync index file", e))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| MnemoError::persistence("Failed to move index file into place", e))?;

        debug!(path = %path.display(), slots = self.vectors.len(), "HNSW: persisted index");
        Ok(())
    }

    fn restore(&mut self, path: &Path, capacity: usize) -> Result<()> {
        let file = File::open(path)
            .map_err(|e| MnemoError::persistence("Failed to open index file", e))?;
        let snapshot: HnswSnapshot = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| MnemoError::persistence("Failed to deserialize index", e))?;

        if snapshot.dimension != self.dimension {
            return Err(MnemoError::PersistenceFailure(format!(
                "index dimension {} does not match expected {}",
                snapshot.dimension, self.dimension
            )));
        }
        if snapshot.vectors.len() > capacity {
            return Err(MnemoError::PersistenceFailure(format!(
                "index holds {} slots, capacity is {}",
                snapshot.vectors.len(),
                capacity
            )));
        }
        if snapshot.levels.len() != snapshot.vectors.len()
            || snapshot.entry_point.map_or(false, |e| e >= snapshot.vectors.len())
        {
            return Err(MnemoError::PersistenceFailure("index snapshot is inconsistent".to_string()));
        }

        let reseed = snapshot.config.seed ^ snapshot.vectors.len() as u64;
        self.m_l = 1.0 / (snapshot.config.m.max(2) as f32).ln();
        self.config = snapshot.config;
        self.vectors = snapshot.vectors;
        self.levels = snapshot.levels;
        self.layers = if snapshot.layers.is_empty() { vec![Layer::default()] } else { snapshot.layers };
        self.entry_point = snapshot.entry_point;
        self.tombstones = TombstoneSet::from_entries(snapshot.tombstones);
        self.rng = StdRng::seed_from_u64(reseed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    #[test]
    fn test_insert_assigns_dense_slots() {
        let mut index = HnswIndex::with_defaults(2);
        for i in 0..5 {
            assert_eq!(index.insert(&unit(i as f32 * 0.1)).unwrap(), i);
        }
        assert_eq!(index.count(), 5);
        assert!(index.layer_count() >= 1);
    }

    #[test]
    fn test_dimension_is_enforced() {
        let mut index = HnswIndex::with_defaults(3);
        let err = index.insert(&[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, MnemoError::VectorDimensionMismatch { expected: 3, got: 2 }));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_search_orders_by_distance() {
        let mut index = HnswIndex::with_defaults(2);
        for i in 0..50 {
            index.insert(&unit(i as f32 * 0.05)).unwrap();
        }
        let hits = index.search(&unit(1.0), 5).unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].slot, 20);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_empty_index_search() {
        let index = HnswIndex::with_defaults(4);
        assert!(index.search(&[0.0, 0.0, 0.0, 1.0], 3).unwrap().is_empty());
    }

    #[test]
    fn test_tombstoned_slots_are_skipped() {
        let mut index = HnswIndex::with_defaults(2);
        for i in 0..10 {
            index.insert(&unit(i as f32 * 0.1)).unwrap();
        }
        index.tombstone(0, TombstoneReason::Decayed).unwrap();
        let hits = index.search(&unit(0.0), 3).unwrap();
        assert!(hits.iter().all(|h| h.slot != 0));
        assert!(index.is_tombstoned(0));
        assert_eq!(index.count(), 10);
        assert!(index.tombstone(99, TombstoneReason::Removed).is_err());
    }

    #[test]
    fn test_search_within_restricts_slots() {
        let mut index = HnswIndex::with_defaults(2);
        for i in 0..30 {
            index.insert(&unit(i as f32 * 0.05)).unwrap();
        }
        let allowed: HashSet<SlotId> = [25, 26, 27].into_iter().collect();
        let hits = index.search_within(&unit(0.0), 10, &allowed).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].slot, 25);
        assert!(hits.iter().all(|h| allowed.contains(&h.slot)));
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodic.index");

        let mut index = HnswIndex::with_defaults(2);
        for i in 0..20 {
            index.insert(&unit(i as f32 * 0.1)).unwrap();
        }
        index.tombstone(3, TombstoneReason::Consolidated).unwrap();
        index.persist(&path).unwrap();

        let mut restored = HnswIndex::with_defaults(2);
        restored.restore(&path, 20).unwrap();
        assert_eq!(restored.count(), 20);
        assert!(restored.is_tombstoned(3));
        assert_eq!(restored.get(7), index.get(7));

        let before = index.search(&unit(0.75), 4).unwrap();
        let after = restored.search(&unit(0.75), 4).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_restore_rejects_over_capacity_and_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semantic.index");
        let mut index = HnswIndex::with_defaults(2);
        for i in 0..5 {
            index.insert(&unit(i as f32)).unwrap();
        }
        index.persist(&path).unwrap();

        let mut small = HnswIndex::with_defaults(2);
        assert!(small.restore(&path, 4).is_err());
        assert_eq!(small.count(), 0);

        let mut wrong = HnswIndex::with_defaults(3);
        assert!(wrong.restore(&path, 10).is_err());
    }
}
