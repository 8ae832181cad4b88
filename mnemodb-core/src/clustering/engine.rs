/// ClusterEngine: builds and edits cluster tables
///
/// Every operation takes a table and the category's live records and
/// returns a new table; publishing it is the caller's job. Operations:
/// 1. Full recluster (k-means++, k from the live record count)
/// 2. Incremental assignment of a new slot to its nearest centroid
/// 3. Centroid/metadata refresh for touched clusters
/// 4. Merge and split
/// 5. Reconciliation of an off-lock result with the live table

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use crate::clustering::kmeans::{kmeans, two_means_split};
use crate::clustering::table::{ClusterId, ClusterMetadata, ClusterTable, TimeRange};
use crate::core::config::ClusterConfig;
use crate::core::errors::{MnemoError, Result};
use crate::index::SlotId;
use crate::memory::record::MemoryRecord;
use crate::vector::distance::{centroid_of, weighted_mean};

pub struct ClusterEngine {
    config: ClusterConfig,
    rng: Mutex<StdRng>,
    cancel: Arc<AtomicBool>,
}

impl ClusterEngine {
    pub fn new(config: ClusterConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        ClusterEngine {
            config,
            rng: Mutex::new(rng),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Abort running and future k-means passes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Independent generator per pass so the shared one is held briefly.
    fn pass_rng(&self) -> StdRng {
        let seed: u64 = self.rng.lock().gen();
        StdRng::seed_from_u64(seed)
    }

    /// Recompute all clusters from scratch. Returns `None` if cancelled.
    /// Ids continue from `next_id` so old ids are never handed out again.
    pub fn full_recluster(
        &self,
        records: &HashMap<SlotId, MemoryRecord>,
        next_id: ClusterId,
    ) -> Option<ClusterTable> {
        let mut table = ClusterTable {
            next_id,
            ..ClusterTable::default()
        };
        if records.is_empty() {
            return Some(table);
        }

        let mut slots: Vec<SlotId> = records.keys().copied().collect();
        slots.sort_unstable();
        let points: Vec<&[f32]> = slots.iter().map(|s| records[s].vector.as_slice()).collect();

        let k = self.config.target_k(slots.len()).min(slots.len());
        let mut rng = self.pass_rng();
        let outcome = kmeans(&points, k, self.config.max_iterations, &mut rng, &self.cancel)?;

        let ids: Vec<ClusterId> = outcome.centroids.iter().map(|_| table.allocate_id()).collect();
        let mut grouped: BTreeMap<ClusterId, Vec<SlotId>> = BTreeMap::new();
        for (slot, &c) in slots.iter().zip(outcome.assignments.iter()) {
            table.assignments.insert(*slot, ids[c]);
            grouped.entry(ids[c]).or_default().push(*slot);
        }
        for (id, members) in grouped {
            if let Some(meta) = self.metadata_for(id, &members, records) {
                table.clusters.insert(id, meta);
            }
        }

        debug!(
            requested_k = k,
            clusters = table.len(),
            iterations = outcome.iterations,
            converged = outcome.converged,
            "Full recluster computed"
        );
        Some(table)
    }

    /// Assign one new slot to the nearest centroid without moving any
    /// centroid. A table with no clusters gets a singleton cluster.
    pub fn assign_incremental(
        &self,
        table: &ClusterTable,
        slot: SlotId,
        record: &MemoryRecord,
    ) -> (ClusterTable, ClusterId) {
        let mut next = table.clone();
        let id = match next.nearest(&record.vector) {
            Some(id) => id,
            None => {
                let id = next.allocate_id();
                next.clusters.insert(id, ClusterMetadata {
                    id,
                    centroid: record.vector.clone(),
                    size: 0,
                    average_strength: 0.0,
                    dominant_labels: record.labels.iter().take(self.config.dominant_labels).cloned().collect(),
                    time_range: TimeRange { start: record.timestamp, end: record.timestamp },
                });
                id
            }
        };

        next.assignments.insert(slot, id);
        if let Some(cluster) = next.clusters.get_mut(&id) {
            let size = cluster.size as f32;
            cluster.average_strength = (cluster.average_strength * size + record.strength) / (size + 1.0);
            cluster.size += 1;
            cluster.time_range.start = cluster.time_range.start.min(record.timestamp);
            cluster.time_range.end = cluster.time_range.end.max(record.timestamp);
        }
        (next, id)
    }

    /// Recompute centroid and metadata of the given clusters from their
    /// current members. Clusters left without members are dropped.
    pub fn refresh(
        &self,
        table: &ClusterTable,
        touched: &BTreeSet<ClusterId>,
        records: &HashMap<SlotId, MemoryRecord>,
    ) -> ClusterTable {
        let mut next = table.clone();
        self.refresh_in_place(&mut next, touched, records);
        next
    }

    fn refresh_in_place(
        &self,
        table: &mut ClusterTable,
        touched: &BTreeSet<ClusterId>,
        records: &HashMap<SlotId, MemoryRecord>,
    ) {
        if touched.is_empty() {
            return;
        }
        let mut grouped: BTreeMap<ClusterId, Vec<SlotId>> =
            touched.iter().map(|&id| (id, Vec::new())).collect();
        for (&slot, id) in &table.assignments {
            if let Some(members) = grouped.get_mut(id) {
                members.push(slot);
            }
        }
        for (id, mut members) in grouped {
            members.sort_unstable();
            match self.metadata_for(id, &members, records) {
                Some(meta) => {
                    table.clusters.insert(id, meta);
                }
                None => {
                    table.clusters.remove(&id);
                    table.assignments.retain(|_, c| *c != id);
                }
            }
        }
    }

    /// Fold two clusters into a new one with a size-weighted centroid.
    pub fn merge(
        &self,
        table: &ClusterTable,
        category: &str,
        a: ClusterId,
        b: ClusterId,
        records: &HashMap<SlotId, MemoryRecord>,
    ) -> Result<(ClusterTable, ClusterId)> {
        let invalid = |cluster_id| MnemoError::InvalidClusterId {
            category: category.to_string(),
            cluster_id,
        };
        let first = table.get(a).ok_or_else(|| invalid(a))?;
        let second = table.get(b).ok_or_else(|| invalid(b))?;
        if a == b {
            return Err(invalid(b));
        }

        let centroid = weighted_mean(&first.centroid, first.size, &second.centroid, second.size);

        let mut next = table.clone();
        next.clusters.remove(&a);
        next.clusters.remove(&b);
        let merged = next.allocate_id();

        let mut members = Vec::new();
        for (&slot, id) in next.assignments.iter_mut() {
            if *id == a || *id == b {
                *id = merged;
                members.push(slot);
            }
        }
        members.sort_unstable();

        if let Some(mut meta) = self.metadata_for(merged, &members, records) {
            meta.centroid = centroid;
            next.clusters.insert(merged, meta);
        }

        debug!(category, from = ?[a, b], into = merged, size = members.len(), "Merged clusters");
        Ok((next, merged))
    }

    /// Replace one cluster by two, separated with a local 2-means pass.
    pub fn split(
        &self,
        table: &ClusterTable,
        category: &str,
        id: ClusterId,
        records: &HashMap<SlotId, MemoryRecord>,
    ) -> Result<(ClusterTable, ClusterId, ClusterId)> {
        if table.get(id).is_none() {
            return Err(MnemoError::InvalidClusterId {
                category: category.to_string(),
                cluster_id: id,
            });
        }

        let members: Vec<SlotId> = table
            .members(id)
            .into_iter()
            .filter(|slot| records.contains_key(slot))
            .collect();
        if members.len() < 2 {
            return Err(MnemoError::ClusterTooSmall { cluster_id: id, size: members.len() });
        }

        let points: Vec<&[f32]> = members.iter().map(|s| records[s].vector.as_slice()).collect();
        let mut rng = self.pass_rng();
        // A split is a caller request; it is not subject to cancellation
        let (left, right) = two_means_split(&points, self.config.max_iterations, &mut rng, &AtomicBool::new(false))
            .unwrap_or_else(|| {
                let mid = members.len() / 2;
                ((0..mid).collect(), (mid..members.len()).collect())
            });

        let mut next = table.clone();
        next.clusters.remove(&id);
        next.assignments.retain(|_, c| *c != id);
        let left_id = next.allocate_id();
        let right_id = next.allocate_id();

        for (side_id, side) in [(left_id, &left), (right_id, &right)] {
            let side_members: Vec<SlotId> = side.iter().map(|&i| members[i]).collect();
            for &slot in &side_members {
                next.assignments.insert(slot, side_id);
            }
            if let Some(meta) = self.metadata_for(side_id, &side_members, records) {
                next.clusters.insert(side_id, meta);
            }
        }

        debug!(category, cluster = id, into = ?[left_id, right_id], "Split cluster");
        Ok((next, left_id, right_id))
    }

    /// Drop slots from the table, refreshing the clusters they left.
    pub fn remove_slots(
        &self,
        table: &ClusterTable,
        slots: &[SlotId],
        records: &HashMap<SlotId, MemoryRecord>,
    ) -> ClusterTable {
        let mut next = table.clone();
        let mut touched = BTreeSet::new();
        for slot in slots {
            if let Some(id) = next.assignments.remove(slot) {
                touched.insert(id);
            }
        }
        self.refresh_in_place(&mut next, &touched, records);
        next
    }

    /// Bring a table computed from an older snapshot up to date with the
    /// live records: slots inserted meanwhile join their nearest cluster,
    /// slots archived meanwhile are dropped.
    pub fn reconcile(
        &self,
        mut computed: ClusterTable,
        latest: &ClusterTable,
        records: &HashMap<SlotId, MemoryRecord>,
    ) -> ClusterTable {
        computed.next_id = computed.next_id.max(latest.next_id);
        let mut touched = BTreeSet::new();

        computed.assignments.retain(|slot, id| {
            let live = records.contains_key(slot);
            if !live {
                touched.insert(*id);
            }
            live
        });

        let mut missing: Vec<SlotId> = records
            .keys()
            .filter(|slot| !computed.assignments.contains_key(slot))
            .copied()
            .collect();
        missing.sort_unstable();
        for slot in missing {
            let record = &records[&slot];
            let id = match computed.nearest(&record.vector) {
                Some(id) => id,
                None => {
                    let id = computed.allocate_id();
                    computed.clusters.insert(id, ClusterMetadata {
                        id,
                        centroid: record.vector.clone(),
                        size: 0,
                        average_strength: 0.0,
                        dominant_labels: Vec::new(),
                        time_range: TimeRange { start: record.timestamp, end: record.timestamp },
                    });
                    id
                }
            };
            computed.assignments.insert(slot, id);
            touched.insert(id);
        }

        self.refresh_in_place(&mut computed, &touched, records);
        computed
    }

    /// Metadata of a cluster from its members. `None` when no member is live.
    pub fn metadata_for(
        &self,
        id: ClusterId,
        members: &[SlotId],
        records: &HashMap<SlotId, MemoryRecord>,
    ) -> Option<ClusterMetadata> {
        let live: Vec<&MemoryRecord> = members.iter().filter_map(|s| records.get(s)).collect();
        let centroid = centroid_of(live.iter().map(|r| r.vector.as_slice()))?;

        let total_strength: f32 = live.iter().map(|r| r.strength).sum();
        let mut label_counts: HashMap<&str, usize> = HashMap::new();
        for record in &live {
            for label in &record.labels {
                *label_counts.entry(label.as_str()).or_insert(0) += 1;
            }
        }
        let mut labels: Vec<(&str, usize)> = label_counts.into_iter().collect();
        labels.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let start = live.iter().map(|r| r.timestamp).min().unwrap_or(0);
        let end = live.iter().map(|r| r.timestamp).max().unwrap_or(0);

        Some(ClusterMetadata {
            id,
            centroid,
            size: live.len(),
            average_strength: total_strength / live.len() as f32,
            dominant_labels: labels
                .into_iter()
                .take(self.config.dominant_labels)
                .map(|(label, _)| label.to_string())
                .collect(),
            time_range: TimeRange { start, end },
        })
    }
}
