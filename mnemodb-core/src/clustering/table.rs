/// Cluster table of one category.
///
/// Tables are immutable once published: the engine builds a new table and
/// the category swaps it in whole, so readers always see one consistent
/// assignment.

use std::collections::{BTreeMap, HashMap};
use serde::{Deserialize, Serialize};
use crate::index::SlotId;
use crate::vector::distance::squared_l2_distance;

pub type ClusterId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub id: ClusterId,
    pub centroid: Vec<f32>,
    pub size: usize,
    pub average_strength: f32,
    /// Most frequent labels, by count then name
    pub dominant_labels: Vec<String>,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTable {
    pub clusters: BTreeMap<ClusterId, ClusterMetadata>,
    pub assignments: HashMap<SlotId, ClusterId>,
    /// Next id to hand out; ids are never reused within a category
    pub next_id: ClusterId,
}

impl ClusterTable {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn get(&self, id: ClusterId) -> Option<&ClusterMetadata> {
        self.clusters.get(&id)
    }

    pub fn cluster_of(&self, slot: SlotId) -> Option<ClusterId> {
        self.assignments.get(&slot).copied()
    }

    /// Sorted members of one cluster.
    pub fn members(&self, id: ClusterId) -> Vec<SlotId> {
        let mut members: Vec<SlotId> = self
            .assignments
            .iter()
            .filter(|(_, &c)| c == id)
            .map(|(&slot, _)| slot)
            .collect();
        members.sort_unstable();
        members
    }

    /// Sorted members of every cluster, empty clusters included.
    pub fn members_by_cluster(&self) -> BTreeMap<ClusterId, Vec<SlotId>> {
        let mut grouped: BTreeMap<ClusterId, Vec<SlotId>> =
            self.clusters.keys().map(|&id| (id, Vec::new())).collect();
        for (&slot, &id) in &self.assignments {
            grouped.entry(id).or_default().push(slot);
        }
        for members in grouped.values_mut() {
            members.sort_unstable();
        }
        grouped
    }

    /// Cluster whose centroid is nearest to `vector`; ties go to the lowest id.
    pub fn nearest(&self, vector: &[f32]) -> Option<ClusterId> {
        let mut best: Option<(ClusterId, f32)> = None;
        for (&id, cluster) in &self.clusters {
            let dist = squared_l2_distance(vector, &cluster.centroid);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((id, dist)),
            }
        }
        best.map(|(id, _)| id)
    }

    pub(crate) fn allocate_id(&mut self) -> ClusterId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Every assignment points at a known cluster and sizes match the
    /// member counts.
    pub fn is_consistent(&self) -> bool {
        let grouped = self.members_by_cluster();
        if grouped.len() != self.clusters.len() {
            return false;
        }
        self.clusters
            .iter()
            .all(|(id, cluster)| grouped.get(id).map(Vec::len) == Some(cluster.size))
            && self.clusters.keys().all(|&id| id < self.next_id)
    }
}
