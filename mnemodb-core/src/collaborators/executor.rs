/// Task executors for clustering and rebalance passes.

use std::fmt;
use rayon::{ThreadPool, ThreadPoolBuilder};
use crate::core::errors::{Collaborator, MnemoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Clustering,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Clustering => write!(f, "clustering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

pub type TaskJob = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskExecutor: Send + Sync {
    /// Schedule a job. An error means the job was not accepted and was
    /// dropped without running.
    fn submit(&self, task_type: TaskType, job: TaskJob, priority: TaskPriority) -> Result<()>;
}

/// Runs every job on the caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn submit(&self, _task_type: TaskType, job: TaskJob, _priority: TaskPriority) -> Result<()> {
        job();
        Ok(())
    }
}

/// Runs jobs on a dedicated rayon pool. High-priority jobs are queued
/// FIFO, the rest LIFO so fresh work is picked up first.
pub struct RayonExecutor {
    pool: ThreadPool,
}

impl RayonExecutor {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mnemodb-worker-{}", i))
            .build()
            .map_err(|e| MnemoError::collaborator(Collaborator::TaskBackend, e))?;
        Ok(RayonExecutor { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskExecutor for RayonExecutor {
    fn submit(&self, task_type: TaskType, job: TaskJob, priority: TaskPriority) -> Result<()> {
        tracing::trace!(%task_type, ?priority, "Submitting job to rayon pool");
        match priority {
            TaskPriority::High => self.pool.spawn_fifo(job),
            TaskPriority::Normal | TaskPriority::Low => self.pool.spawn(job),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_inline_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        InlineExecutor
            .submit(TaskType::Clustering, Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }), TaskPriority::Normal)
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rayon_runs_jobs() {
        let executor = RayonExecutor::new(2).unwrap();
        assert_eq!(executor.threads(), 2);

        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            executor
                .submit(TaskType::Clustering, Box::new(move || { tx.send(i).unwrap(); }), TaskPriority::High)
                .unwrap();
        }
        let mut received: Vec<i32> = (0..4).map(|_| rx.recv().unwrap()).collect();
        received.sort_unstable();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }
}
