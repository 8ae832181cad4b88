use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};
use crate::core::config::RecordDefaults;
use crate::core::utils::{current_timestamp_ms, generate_memory_id};
use crate::index::{SlotId, TombstoneReason};

/// A live memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub category: String,
    pub vector: Vec<f32>,
    /// Decayable weight in [min_strength, 1]
    pub strength: f32,
    /// Creation time (ms)
    pub timestamp: u64,
    pub last_accessed: u64,
    pub access_count: u64,
    pub decay_rate: f32,
    pub importance: f32,
    pub content: String,
    pub labels: BTreeSet<String>,
    /// Ids of related records in the same category
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// Last time decay was applied (ms)
    #[serde(default)]
    pub last_decayed: Option<u64>,
}

impl MemoryRecord {
    /// Record an access.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_accessed = self.last_accessed.max(now_ms);
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Start of the window decay has not been applied to yet.
    pub fn decay_anchor(&self) -> u64 {
        match self.last_decayed {
            Some(decayed) => decayed.max(self.last_accessed),
            None => self.last_accessed,
        }
    }
}

/// Input of `MemoryStore::insert`. Fields left unset are filled from
/// `RecordDefaults` or the relevance service.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub id: Option<String>,
    pub category: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub labels: BTreeSet<String>,
    pub references: BTreeSet<String>,
    pub strength: Option<f32>,
    pub decay_rate: Option<f32>,
    pub importance: Option<f32>,
    pub timestamp: Option<u64>,
}

impl NewMemory {
    pub fn new(category: impl Into<String>, vector: Vec<f32>) -> Self {
        NewMemory {
            id: None,
            category: category.into(),
            vector,
            content: String::new(),
            labels: BTreeSet::new(),
            references: BTreeSet::new(),
            strength: None,
            decay_rate: None,
            importance: None,
            timestamp: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_references<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_decay_rate(mut self, decay_rate: f32) -> Self {
        self.decay_rate = Some(decay_rate);
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// Materialize the record, filling every unset field.
    pub(crate) fn into_record(self, defaults: &RecordDefaults) -> MemoryRecord {
        let now = current_timestamp_ms();
        let timestamp = self.timestamp.unwrap_or(now);
        MemoryRecord {
            id: self.id.unwrap_or_else(generate_memory_id),
            category: self.category,
            vector: self.vector,
            strength: self.strength.unwrap_or(defaults.strength).clamp(0.0, 1.0),
            timestamp,
            last_accessed: timestamp,
            access_count: 0,
            decay_rate: self.decay_rate.unwrap_or(defaults.decay_rate).max(0.0),
            importance: self.importance.unwrap_or(defaults.importance).clamp(0.0, 1.0),
            content: self.content,
            labels: self.labels,
            references: self.references,
            last_decayed: None,
        }
    }
}

/// Maps an index slot to the memory stored in it. Written once on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMetadata {
    pub memory_id: String,
    pub category: String,
    pub inserted_at: u64,
}

/// A record moved out of the active structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRecord {
    pub slot: SlotId,
    pub record: MemoryRecord,
    pub reason: TombstoneReason,
    pub archived_at: u64,
}

/// One `query_similar` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub memory_id: String,
    pub similarity: f32,
}
