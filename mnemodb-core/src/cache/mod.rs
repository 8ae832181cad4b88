pub mod result_cache;
pub mod sweeper;

pub use result_cache::{CacheEntry, CacheStats, ResultCache};
pub use sweeper::{CacheSweeper, Sweepable};
