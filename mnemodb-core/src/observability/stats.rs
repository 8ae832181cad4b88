/// Point-in-time statistics of the store.

use serde::Serialize;
use crate::cache::CacheStats;
use crate::memory::category::CategoryActivity;

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: String,
    pub dimension: usize,
    pub live_records: usize,
    pub archived_records: usize,
    /// Slots ever handed out by the index, tombstones included
    pub index_slots: usize,
    pub clusters: usize,
    pub partitions: usize,
    pub largest_partition: usize,
    /// Inserts not yet covered by a clustering pass
    pub pending_inserts: usize,
    pub average_strength: Option<f32>,
    pub activity: CategoryActivity,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub categories: Vec<CategoryStats>,
    pub query_cache: CacheStats,
    pub record_cache: CacheStats,
}

impl StoreStats {
    pub fn live_records(&self) -> usize {
        self.categories.iter().map(|c| c.live_records).sum()
    }

    pub fn category(&self, name: &str) -> Option<&CategoryStats> {
        self.categories.iter().find(|c| c.category == name)
    }
}
