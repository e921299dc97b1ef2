//! Bounded worker pool for units of work.
//!
//! Units (a baseline capture or one agent run) are spawned freely by the
//! orchestrator; each waits for a permit before doing any work, so at most
//! `num_workers` units run at once across every tier.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::metrics::MetricsCollector;

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of worker slots.
    pub num_workers: usize,
    /// Units currently holding a slot.
    pub active_workers: usize,
    /// Units that ran to completion.
    pub jobs_completed: u64,
    /// Average time a unit held its slot.
    pub average_job_duration: Duration,
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            average_job_duration: if completed == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(total_duration_ms / completed)
            },
        }
    }
}

/// Decrements the active count even when the unit is aborted.
struct ActiveGuard<'a> {
    stats: &'a SharedPoolStats,
    metrics: &'a MetricsCollector,
}

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a SharedPoolStats, metrics: &'a MetricsCollector) -> Self {
        stats.active_workers.fetch_add(1, Ordering::SeqCst);
        metrics.worker_started();
        Self { stats, metrics }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);
        self.metrics.worker_finished();
    }
}

/// Semaphore-bounded pool. Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    num_workers: usize,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a pool with `num_workers` slots (at least one).
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(num_workers)),
            num_workers,
            stats: Arc::new(SharedPoolStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Waits for a free slot, then runs `job` while holding it.
    pub async fn run<F: Future>(&self, job: F) -> F::Output {
        // The semaphore is never closed, so acquisition only fails if that changes.
        let _permit = self.permits.acquire().await.ok();
        let _active = ActiveGuard::enter(&self.stats, &self.metrics);
        let started = Instant::now();
        let output = job.await;
        self.stats.record_completion(started.elapsed());
        output
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers)
    }
}
