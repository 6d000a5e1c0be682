//! Injection points around the run lifecycle.
//!
//! Embedders customize a run by implementing [`RunHooks`]; every method has
//! a no-op default. Hooks run in different processes: `prepare`,
//! `queue_status`, and `summarize` in the master, `after_fork`,
//! `around_filter`, and `run_worker` in each worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::framework::Suite;
use crate::protocol::{SuiteResult, WorkerRecord};
use crate::worker::WorkerContext;

/// Heartbeat payload handed to [`RunHooks::queue_status`] once per dispatch
/// loop iteration.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub start_time: DateTime<Utc>,
    pub queue_size: usize,
    pub local_workers: usize,
    pub remote_workers: usize,
}

/// Optional callbacks on the run context.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// Runs exactly once in the master before any worker is spawned, e.g.
    /// to create per-worker databases.
    async fn prepare(&self, _concurrency: usize) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs in each worker process before its dispatch loop starts.
    async fn after_fork(&self, _worker_num: usize) {}

    /// Heartbeat for external observers. Must not block; the dispatch loop
    /// calls it inline.
    fn queue_status(&self, _status: &QueueSnapshot) {}

    /// Runs in the worker before each suite. Returning a result
    /// short-circuits execution of that suite.
    async fn around_filter(&self, _suite: &Suite) -> Option<SuiteResult> {
        None
    }

    /// Replace the built-in worker loop entirely. Returning an exit code
    /// skips the default loop.
    async fn run_worker(&self, _ctx: &WorkerContext) -> Option<i32> {
        None
    }

    /// Runs in the master after every worker has been reaped, before the
    /// summary is printed.
    async fn summarize(&self, _completed: &[WorkerRecord]) {}
}

/// The hooks used when an embedder supplies none: everything defaulted,
/// plus a debug-level heartbeat.
pub struct DefaultHooks;

#[async_trait]
impl RunHooks for DefaultHooks {
    fn queue_status(&self, status: &QueueSnapshot) {
        debug!(
            "queue={} local_workers={} remote_workers={} elapsed={}s",
            status.queue_size,
            status.local_workers,
            status.remote_workers,
            (Utc::now() - status.start_time).num_seconds()
        );
    }
}
