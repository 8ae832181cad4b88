pub mod consolidation;
pub mod decay;
pub mod scheduler;

use serde::Serialize;

pub use scheduler::MaintenanceScheduler;

/// Outcome of one maintenance cycle for one category
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryMaintenance {
    pub category: String,
    /// Records decay was applied to
    pub decayed: usize,
    /// Records archived at the strength floor
    pub archived: usize,
    /// Records folded into a survivor
    pub consolidated: usize,
    pub rebalanced: bool,
}

/// Outcome of one maintenance cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub started_at: u64,
    pub duration_ms: u64,
    /// Another cycle was already running; nothing was done
    pub skipped: bool,
    pub categories: Vec<CategoryMaintenance>,
    /// Categories busy with clustering or rebalancing, left for next cycle
    pub busy_categories: Vec<String>,
    pub cache_evictions: usize,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    pub fn archived(&self) -> usize {
        self.categories.iter().map(|c| c.archived + c.consolidated).sum()
    }
}
