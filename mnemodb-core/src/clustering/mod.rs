pub mod engine;
pub mod kmeans;
pub mod table;

pub use engine::ClusterEngine;
pub use table::{ClusterId, ClusterMetadata, ClusterTable, TimeRange};
