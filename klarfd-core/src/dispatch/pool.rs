use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::dispatch::queue::{DispatchItem, DispatchQueue};
use crate::job::{Job, JobOutcome};

/// Runs one job to its outcome. Implemented by the executor.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> JobOutcome;
}

/// Worker pool sizing and lifecycle policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    /// Replace a worker after it has handled this many queue items.
    pub max_tasks_per_worker: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_tasks_per_worker: None,
        }
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    completed: AtomicU64,
    quarantined: AtomicU64,
    timed_out: AtomicU64,
    missing: AtomicU64,
    panicked: AtomicU64,
    recycled: AtomicU64,
}

impl PoolStats {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed { .. } => &self.completed,
            JobOutcome::Quarantined { .. } => &self.quarantined,
            JobOutcome::TimedOut => &self.timed_out,
            JobOutcome::Missing => &self.missing,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, submitted: u64) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            submitted,
            completed: self.completed.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub quarantined: u64,
    pub timed_out: u64,
    pub missing: u64,
    pub panicked: u64,
    pub recycled: u64,
}

impl PoolStatsSnapshot {
    /// Jobs that reached an outcome, including ones whose runner panicked.
    pub fn resolved(&self) -> u64 {
        self.completed + self.quarantined + self.timed_out + self.missing + self.panicked
    }
}

impl fmt::Display for PoolStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "submitted={} completed={} quarantined={} timed_out={} missing={} panicked={} recycled={}",
            self.submitted,
            self.completed,
            self.quarantined,
            self.timed_out,
            self.missing,
            self.panicked,
            self.recycled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Stopped,
    Recycled,
    Disconnected,
}

#[derive(Clone)]
struct WorkerContext {
    queue: Arc<DispatchQueue>,
    runner: Arc<dyn JobRunner>,
    stats: Arc<PoolStats>,
    live: Arc<AtomicUsize>,
    budget: Option<usize>,
}

/// Fixed set of workers consuming the dispatch queue.
///
/// A supervisor task keeps exactly `workers` of them alive: a worker that
/// used up its task budget or panicked is replaced, one that took a stop
/// token is not.
pub struct WorkerPool {
    config: PoolConfig,
    queue: Arc<DispatchQueue>,
    stats: Arc<PoolStats>,
    live: Arc<AtomicUsize>,
    supervisor: JoinHandle<()>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("live_workers", &self.live.load(Ordering::Relaxed))
            .field("outstanding", &self.queue.outstanding())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn start(
        config: PoolConfig,
        queue: Arc<DispatchQueue>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let config = PoolConfig {
            workers: config.workers.max(1),
            max_tasks_per_worker: config.max_tasks_per_worker.filter(|budget| *budget > 0),
        };
        let stats = Arc::new(PoolStats::default());
        let live = Arc::new(AtomicUsize::new(0));
        let context = WorkerContext {
            queue: Arc::clone(&queue),
            runner,
            stats: Arc::clone(&stats),
            live: Arc::clone(&live),
            budget: config.max_tasks_per_worker,
        };

        info!(
            target: "dispatch::pool",
            workers = config.workers,
            max_tasks_per_worker = ?config.max_tasks_per_worker,
            "starting worker pool"
        );
        let supervisor = tokio::spawn(supervise(config.workers, context));

        Self {
            config,
            queue,
            stats,
            live,
            supervisor,
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn queue(&self) -> Arc<DispatchQueue> {
        Arc::clone(&self.queue)
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot(self.queue.submitted())
    }

    /// Stop the pool.
    ///
    /// With `drain`, every job accepted before the call still runs. Without
    /// it, jobs no worker has started yet are dropped; their files stay in
    /// the input directory. Either way jobs already being executed finish,
    /// and the call returns once all workers have exited.
    pub async fn shutdown(mut self, drain: bool) -> PoolStatsSnapshot {
        info!(
            target: "dispatch::pool",
            drain,
            outstanding = self.queue.outstanding(),
            "shutting down worker pool"
        );
        self.queue.close();
        if !drain {
            self.queue.discard_pending();
        }
        self.queue.push_stop(self.config.workers);

        if let Err(err) = (&mut self.supervisor).await {
            error!(target: "dispatch::pool", error = %err, "worker supervisor failed");
        }

        let stats = self.stats();
        info!(target: "dispatch::pool", %stats, "worker pool stopped");
        stats
    }
}

async fn supervise(workers: usize, context: WorkerContext) {
    let mut set = JoinSet::new();
    let mut next_id = 0usize;
    for _ in 0..workers {
        spawn_worker(&mut set, next_id, &context);
        next_id += 1;
    }

    while let Some(joined) = set.join_next().await {
        context.live.fetch_sub(1, Ordering::AcqRel);
        match joined {
            Ok(WorkerExit::Stopped) => {}
            Ok(WorkerExit::Recycled) => {
                context.stats.recycled.fetch_add(1, Ordering::Relaxed);
                spawn_worker(&mut set, next_id, &context);
                next_id += 1;
            }
            Ok(WorkerExit::Disconnected) => {
                warn!(target: "dispatch::pool", "dispatch queue disconnected");
            }
            Err(err) if err.is_panic() => {
                error!(target: "dispatch::pool", critical = true, "worker panicked, respawning");
                spawn_worker(&mut set, next_id, &context);
                next_id += 1;
            }
            Err(err) => {
                warn!(target: "dispatch::pool", error = %err, "worker task ended abnormally");
            }
        }
    }
}

fn spawn_worker(set: &mut JoinSet<WorkerExit>, id: usize, context: &WorkerContext) {
    context.live.fetch_add(1, Ordering::AcqRel);
    set.spawn(run_worker(id, context.clone()));
}

async fn run_worker(id: usize, context: WorkerContext) -> WorkerExit {
    debug!(target: "dispatch::pool", worker = id, "worker started");
    let mut handled = 0usize;

    loop {
        if context.budget.is_some_and(|budget| handled >= budget) {
            debug!(target: "dispatch::pool", worker = id, handled, "worker reached task budget");
            return WorkerExit::Recycled;
        }

        let Some(item) = context.queue.recv().await else {
            return WorkerExit::Disconnected;
        };
        match item {
            DispatchItem::Stop => {
                debug!(target: "dispatch::pool", worker = id, handled, "worker stopping");
                return WorkerExit::Stopped;
            }
            DispatchItem::Job(job) => run_one(id, &context, job).await,
            DispatchItem::Chunk(jobs) => {
                for job in jobs {
                    run_one(id, &context, job).await;
                }
            }
        }
        handled += 1;
    }
}

async fn run_one(worker: usize, context: &WorkerContext, job: Job) {
    let path = job.source_path.clone();
    let file = job.file_name();

    let left_in_place = match AssertUnwindSafe(context.runner.run(job)).catch_unwind().await {
        Ok(outcome) => {
            debug!(
                target: "dispatch::pool",
                worker,
                %file,
                outcome = outcome.label(),
                "job resolved"
            );
            context.stats.record(&outcome);
            matches!(outcome, JobOutcome::TimedOut)
        }
        Err(_) => {
            context.stats.panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                target: "dispatch::pool",
                worker,
                %file,
                critical = true,
                "job runner panicked; file left in place"
            );
            true
        }
    };
    context.queue.acknowledge(&path);
    if left_in_place {
        context.queue.request_rescan();
    }
}
