pub mod errors;
pub mod utils;
pub mod config;

pub use errors::{Collaborator, ErrorCode, MnemoError, Result};
pub use utils::*;
pub use config::{
    CacheConfig, ClusterConfig, ConsolidationConfig, DecayConfig, IndexConfig,
    MaintenanceConfig, MemoryConfig, PartitionConfig, RecordDefaults,
};
