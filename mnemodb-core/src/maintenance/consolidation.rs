/// Consolidation: fold near-duplicate records of a cluster into one.
///
/// Pair similarity is a weighted sum of vector cosine, label Jaccard and
/// relevance agreement. When relevance scores are unavailable the
/// relevance term is dropped and the other two weights are renormalized.

use std::collections::{BTreeSet, HashMap};
use crate::core::config::ConsolidationConfig;
use crate::index::SlotId;
use crate::memory::record::MemoryRecord;
use crate::vector::distance::cosine_similarity;

/// One survivor and the slots folded into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationGroup {
    pub survivor: SlotId,
    pub absorbed: Vec<SlotId>,
}

/// Jaccard index of two label sets; two empty sets count as identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f32 / union as f32
}

/// Weighted similarity of two records. `relevance` holds both records'
/// relevance scores when available.
pub fn pair_similarity(
    a: &MemoryRecord,
    b: &MemoryRecord,
    relevance: Option<(f32, f32)>,
    config: &ConsolidationConfig,
) -> f32 {
    let vector = cosine_similarity(&a.vector, &b.vector);
    let labels = jaccard(&a.labels, &b.labels);

    match relevance {
        Some((ra, rb)) => {
            let total = config.vector_weight + config.label_weight + config.relevance_weight;
            let agreement = 1.0 - (ra - rb).abs().min(1.0);
            (config.vector_weight * vector + config.label_weight * labels + config.relevance_weight * agreement)
                / total
        }
        None => {
            let total = config.vector_weight + config.label_weight;
            (config.vector_weight * vector + config.label_weight * labels) / total
        }
    }
}

/// Greedy grouping of one cluster's members. Leaders are visited by
/// descending strength (ties by slot); each unclaimed member above the
/// threshold against the leader joins the leader's group. Only groups
/// with at least one absorbed member are returned.
///
/// `relevance` is `None` when scores could not be obtained for every
/// member.
pub fn plan_groups(
    members: &[(SlotId, &MemoryRecord)],
    relevance: Option<&HashMap<SlotId, f32>>,
    config: &ConsolidationConfig,
) -> Vec<ConsolidationGroup> {
    let mut order: Vec<&(SlotId, &MemoryRecord)> = members.iter().collect();
    order.sort_by(|a, b| b.1.strength.total_cmp(&a.1.strength).then_with(|| a.0.cmp(&b.0)));

    let mut claimed: BTreeSet<SlotId> = BTreeSet::new();
    let mut groups = Vec::new();

    for (i, &&(leader_slot, leader)) in order.iter().enumerate() {
        if claimed.contains(&leader_slot) {
            continue;
        }
        claimed.insert(leader_slot);

        let mut absorbed = Vec::new();
        for &&(slot, record) in &order[i + 1..] {
            if claimed.contains(&slot) {
                continue;
            }
            let scores = relevance.and_then(|r| Some((*r.get(&leader_slot)?, *r.get(&slot)?)));
            if pair_similarity(leader, record, scores, config) > config.similarity_threshold {
                claimed.insert(slot);
                absorbed.push(slot);
            }
        }

        if !absorbed.is_empty() {
            groups.push(ConsolidationGroup { survivor: leader_slot, absorbed });
        }
    }
    groups
}

/// Fold `absorbed` into `survivor`: contents concatenated, labels and
/// references unioned, strength, importance and access stats maxed.
pub fn merge_into(survivor: &mut MemoryRecord, absorbed: &MemoryRecord) {
    if !absorbed.content.is_empty() {
        if survivor.content.is_empty() {
            survivor.content = absorbed.content.clone();
        } else {
            survivor.content.push('\n');
            survivor.content.push_str(&absorbed.content);
        }
    }
    survivor.labels.extend(absorbed.labels.iter().cloned());
    survivor.references.extend(absorbed.references.iter().cloned());
    survivor.references.remove(&survivor.id);
    survivor.references.remove(&absorbed.id);

    survivor.strength = survivor.strength.max(absorbed.strength);
    survivor.importance = survivor.importance.max(absorbed.importance);
    survivor.access_count = survivor.access_count.max(absorbed.access_count);
    survivor.last_accessed = survivor.last_accessed.max(absorbed.last_accessed);
    survivor.timestamp = survivor.timestamp.min(absorbed.timestamp);
}
