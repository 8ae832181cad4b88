/// External services the store depends on.
///
/// All of them are optional except the task executor, which defaults to
/// running jobs inline. Failures surface as `CollaboratorUnavailable` and
/// never corrupt store state.

pub mod executor;
pub mod metrics;

use std::collections::BTreeSet;
use crate::core::errors::Result;
use crate::memory::record::MemoryRecord;

pub use executor::{InlineExecutor, RayonExecutor, TaskExecutor, TaskJob, TaskPriority, TaskType};
pub use metrics::{ResourceMetrics, StaticMetrics};

/// Text to vector.
pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Scores and labels for records.
pub trait RelevanceService: Send + Sync {
    /// Relevance in [0, 1]; used as default importance and in consolidation.
    fn predict_relevance(&self, record: &MemoryRecord) -> Result<f32>;

    /// Descriptive tags merged into the record's labels on insert.
    fn generate_tags(&self, record: &MemoryRecord) -> Result<BTreeSet<String>>;

    /// Context labels merged into the record's labels on insert.
    fn analyze_context(&self, record: &MemoryRecord) -> Result<BTreeSet<String>>;
}
