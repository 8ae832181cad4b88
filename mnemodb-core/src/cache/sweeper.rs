/// Background TTL sweeper for one or more caches.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};
use crate::cache::result_cache::ResultCache;

/// Anything with expirable entries.
pub trait Sweepable: Send + Sync {
    /// Drop expired entries, returning how many were removed.
    fn sweep_expired(&self) -> usize;
}

impl<K, V> Sweepable for ResultCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Serialize + Send,
{
    fn sweep_expired(&self) -> usize {
        ResultCache::sweep_expired(self)
    }
}

pub struct CacheSweeper {
    is_running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn(targets: Vec<Arc<dyn Sweepable>>, interval: Duration) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));
        let running = is_running.clone();

        let handle = tokio::spawn(async move {
            info!(caches = targets.len(), interval_ms = interval.as_millis() as u64, "Cache sweeper started");
            while running.load(Ordering::Acquire) {
                sleep(interval).await;
                let swept: usize = targets.iter().map(|t| t.sweep_expired()).sum();
                if swept > 0 {
                    debug!(swept, "Swept expired cache entries");
                }
            }
        });

        CacheSweeper { is_running, handle }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire) && !self.handle.is_finished()
    }

    pub async fn stop(self) {
        self.is_running.store(false, Ordering::Release);
        self.handle.abort();
        let _ = self.handle.await;
        info!("Cache sweeper stopped");
    }
}
