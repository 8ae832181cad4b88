// ============================================================================
// CORE TYPES & UTILITIES
// ============================================================================
pub mod core;
pub mod vector;

// ============================================================================
// INDEXING
// ============================================================================
pub mod index;

// ============================================================================
// ORGANIZATION: CLUSTERS & PARTITIONS
// ============================================================================
pub mod clustering;
pub mod partition;

// ============================================================================
// CACHING
// ============================================================================
pub mod cache;

// ============================================================================
// MAIN STORE & MAINTENANCE
// ============================================================================
pub mod collaborators;
pub mod memory;
pub mod maintenance;

// ============================================================================
// STORAGE & PERSISTENCE
// ============================================================================
pub mod storage;

// ============================================================================
// OBSERVABILITY
// ============================================================================
pub mod observability;

// Re-export commonly used types
pub use core::{ErrorCode, MnemoError, MemoryConfig, Result};
pub use index::{HnswIndex, IndexHit, SlotId, TombstoneReason, VectorIndex};
pub use clustering::{ClusterEngine, ClusterId, ClusterMetadata, ClusterTable};
pub use partition::{Partition, PartitionId, PartitionManager, PartitionTable};
pub use cache::{CacheSweeper, CacheStats, ResultCache};
pub use collaborators::{
    EmbeddingService, InlineExecutor, RayonExecutor, RelevanceService, ResourceMetrics,
    StaticMetrics, TaskExecutor,
};
pub use memory::{ArchivedRecord, CategoryActivity, MemoryRecord, MemoryStore, NewMemory, QueryHit};
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};
pub use observability::{CategoryStats, StoreStats};
