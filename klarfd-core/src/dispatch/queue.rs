use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::job::{Job, JobState};

/// What a worker pulls off the queue.
#[derive(Debug)]
pub enum DispatchItem {
    Job(Job),
    /// Contiguous slice of a batch, processed sequentially by one worker.
    Chunk(Vec<Job>),
    /// Sentinel: the worker that receives it exits without taking more work.
    Stop,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("{} is already in flight", .0.display())]
    AlreadyInFlight(PathBuf),

    #[error("dispatch queue is closed; {} not accepted", .0.display())]
    Closed(PathBuf),

    #[error("{} is {state}, only queued jobs can be submitted", path.display())]
    NotQueued { path: PathBuf, state: JobState },
}

/// Unbounded multi-producer/multi-consumer hand-off between scanners and workers.
///
/// Every accepted path stays in the in-flight set until a worker acknowledges
/// it, so a path can never be held by two workers at once.
#[derive(Debug)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchItem>,
    rx: Mutex<mpsc::UnboundedReceiver<DispatchItem>>,
    in_flight: DashSet<PathBuf>,
    outstanding: AtomicUsize,
    submitted: AtomicU64,
    idle: Notify,
    rescan: Notify,
    closed: AtomicBool,
    discarding: AtomicBool,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            in_flight: DashSet::new(),
            outstanding: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            idle: Notify::new(),
            rescan: Notify::new(),
            closed: AtomicBool::new(false),
            discarding: AtomicBool::new(false),
        }
    }

    /// Hand a single admitted job to the workers.
    pub fn submit(&self, job: Job) -> Result<(), SubmitError> {
        self.reserve(&job)?;
        let path = job.source_path.clone();
        self.tx
            .send(DispatchItem::Job(job))
            .map_err(|_| self.rollback(&[path.clone()], path))
    }

    /// Hand a group of admitted jobs to a single worker.
    ///
    /// Jobs that cannot be accepted are left out of the chunk and reported;
    /// the rest are sent together. Returns how many were accepted.
    pub fn submit_chunk(&self, jobs: Vec<Job>) -> (usize, Vec<SubmitError>) {
        let mut accepted = Vec::with_capacity(jobs.len());
        let mut rejected = Vec::new();
        for job in jobs {
            match self.reserve(&job) {
                Ok(()) => accepted.push(job),
                Err(err) => rejected.push(err),
            }
        }
        if accepted.is_empty() {
            return (0, rejected);
        }

        let count = accepted.len();
        let paths: Vec<PathBuf> = accepted.iter().map(|job| job.source_path.clone()).collect();
        if self.tx.send(DispatchItem::Chunk(accepted)).is_err() {
            for path in &paths {
                rejected.push(self.rollback(std::slice::from_ref(path), path.clone()));
            }
            return (0, rejected);
        }
        (count, rejected)
    }

    fn reserve(&self, job: &Job) -> Result<(), SubmitError> {
        let path = &job.source_path;
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed(path.clone()));
        }
        if job.state() != JobState::Queued {
            return Err(SubmitError::NotQueued {
                path: path.clone(),
                state: job.state(),
            });
        }
        if !self.in_flight.insert(path.clone()) {
            return Err(SubmitError::AlreadyInFlight(path.clone()));
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self, paths: &[PathBuf], path: PathBuf) -> SubmitError {
        for path in paths {
            self.acknowledge(path);
        }
        SubmitError::Closed(path)
    }

    /// Next item for a worker. `None` once every sender is gone.
    ///
    /// While pending work is being discarded, jobs are acknowledged and
    /// skipped here so only stop tokens reach the workers.
    pub async fn recv(&self) -> Option<DispatchItem> {
        let mut rx = self.rx.lock().await;
        loop {
            let item = rx.recv().await?;
            if !self.discarding.load(Ordering::Acquire) {
                return Some(item);
            }
            match item {
                DispatchItem::Stop => return Some(DispatchItem::Stop),
                DispatchItem::Job(job) => self.acknowledge(&job.source_path),
                DispatchItem::Chunk(jobs) => {
                    for job in jobs {
                        self.acknowledge(&job.source_path);
                    }
                }
            }
        }
    }

    /// Mark a dequeued path as resolved. The path becomes eligible for a
    /// later scan again if it is still in the input directory.
    pub fn acknowledge(&self, path: &Path) {
        if self.in_flight.remove(path).is_none() {
            return;
        }
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until every accepted job has been acknowledged.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight.contains(path)
    }

    /// Ask the scanner to look at the input directory again. Used when a
    /// job ended without resolving its file, which then stays in place and
    /// would otherwise go unnoticed by an event-driven scanner.
    pub fn request_rescan(&self) {
        self.rescan.notify_one();
    }

    /// Resolves after the next [`request_rescan`](Self::request_rescan).
    /// A request made while nobody is waiting is kept for the next waiter.
    pub async fn rescan_requested(&self) {
        self.rescan.notified().await;
    }

    /// Accepted jobs not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Total jobs ever accepted.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further submissions. Already accepted work is unaffected.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Drop accepted jobs that no worker has picked up yet.
    pub(crate) fn discard_pending(&self) {
        self.discarding.store(true, Ordering::Release);
    }

    pub(crate) fn push_stop(&self, count: usize) {
        for _ in 0..count {
            // The receiver lives as long as the queue.
            let _ = self.tx.send(DispatchItem::Stop);
        }
    }
}
