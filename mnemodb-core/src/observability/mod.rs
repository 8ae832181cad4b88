pub mod stats;

pub use stats::{CategoryStats, StoreStats};
