pub mod manager;
pub mod table;

pub use manager::{PartitionChoice, PartitionManager, RebalanceOutcome};
pub use table::{Partition, PartitionId, PartitionTable};
