/// MaintenanceScheduler: periodic maintenance in the background
///
/// Responsibilities:
/// 1. Wake up every `check_interval_ms`
/// 2. Run a cycle when `interval_ms` has elapsed since the last one, or
///    right away when the store reports weak memories
/// 3. Defer regular cycles while the host is busy
/// 4. Count completed cycles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use crate::collaborators::ResourceMetrics;
use crate::core::config::MaintenanceConfig;
use crate::core::errors::{MnemoError, Result};
use crate::maintenance::MaintenanceReport;
use crate::memory::MemoryStore;

pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    store: MemoryStore,
    metrics: Arc<dyn ResourceMetrics>,

    /// Is scheduler running?
    is_running: Arc<AtomicBool>,

    /// Completed maintenance cycles
    cycles: Arc<AtomicU64>,

    /// Handle to background task (if any)
    background_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl MaintenanceScheduler {
    pub fn new(store: MemoryStore, metrics: Arc<dyn ResourceMetrics>) -> Self {
        let config = store.config().maintenance.clone();
        Self::with_config(store, metrics, config)
    }

    pub fn with_config(store: MemoryStore, metrics: Arc<dyn ResourceMetrics>, config: MaintenanceConfig) -> Self {
        MaintenanceScheduler {
            config,
            store,
            metrics,
            is_running: Arc::new(AtomicBool::new(false)),
            cycles: Arc::new(AtomicU64::new(0)),
            background_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the background loop. A disabled scheduler does nothing;
    /// starting twice is an error.
    pub fn start(&self) -> Result<()> {
        if !self.config.enabled {
            debug!("Maintenance scheduler disabled");
            return Ok(());
        }
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(MnemoError::AlreadyRunning("maintenance scheduler".to_string()));
        }

        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let config = self.config.clone();
        let is_running = self.is_running.clone();
        let cycles = self.cycles.clone();

        let task = tokio::spawn(async move {
            let check_interval = Duration::from_millis(config.check_interval_ms.max(1));
            let interval = Duration::from_millis(config.interval_ms);
            let mut last_run = Instant::now();

            while is_running.load(Ordering::Acquire) {
                sleep(check_interval).await;

                let urgent = store.needs_maintenance();
                if !urgent && last_run.elapsed() < interval {
                    continue;
                }
                let load = metrics.cpu_load();
                if !urgent && load > config.max_cpu_load {
                    debug!(
                        cpu_load = load,
                        max = config.max_cpu_load,
                        memory_used_bytes = metrics.memory_used_bytes(),
                        "Host busy, deferring maintenance"
                    );
                    continue;
                }

                match run_blocking(store.clone()).await {
                    Ok(report) if !report.skipped => {
                        cycles.fetch_add(1, Ordering::AcqRel);
                        last_run = Instant::now();
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Maintenance cycle failed"),
                }
            }
        });

        *self.background_task.write() = Some(task);
        info!(
            interval_ms = self.config.interval_ms,
            check_interval_ms = self.config.check_interval_ms,
            "Maintenance scheduler started"
        );
        Ok(())
    }

    /// Stop the loop. A cycle in progress finishes on its blocking thread.
    pub async fn stop(&self) -> Result<()> {
        self.is_running.store(false, Ordering::Release);

        let task = self.background_task.write().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!(cycles = self.cycles(), "Maintenance scheduler stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Run one cycle now, off the async runtime.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let report = run_blocking(self.store.clone()).await?;
        if !report.skipped {
            self.cycles.fetch_add(1, Ordering::AcqRel);
        }
        Ok(report)
    }
}

async fn run_blocking(store: MemoryStore) -> Result<MaintenanceReport> {
    tokio::task::spawn_blocking(move || store.run_maintenance())
        .await
        .map_err(|e| MnemoError::collaborator(crate::core::errors::Collaborator::TaskBackend, e))
}
