//! Source scanners: find report files in the input directory, run them
//! through the stability gate and hand admitted jobs to the dispatch queue.
//!
//! Two strategies share the helpers below: [`batch::BatchScanner`] lists the
//! directory on an interval, [`watch::WatchScanner`] reacts to filesystem
//! events and falls back to polling.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dispatch::DispatchQueue;
use crate::fs::FileSystem;
use crate::job::Job;
use crate::stability::Admission;

pub mod batch;
#[cfg(feature = "watch")]
pub mod watch;

/// Which scanner drives ingestion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerMode {
    #[default]
    Batch,
    Watch,
}

/// How a discovered batch is handed to the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One queue item per file.
    #[default]
    PerFile,
    /// Large batches are split into one contiguous chunk per worker.
    Chunked,
}

#[derive(Clone, Debug)]
pub struct ScanSettings {
    pub input_dir: PathBuf,
    /// Delay between two batch scans that found files.
    pub interval: Duration,
    /// Delay before rescanning an empty directory.
    pub idle_sleep: Duration,
    /// Directory existence check cadence in watch mode.
    pub health_check_interval: Duration,
    /// Sweep cadence when filesystem events are unavailable.
    pub poll_interval: Duration,
    /// Stability checks run in parallel per scan.
    pub gate_concurrency: usize,
    pub dispatch: DispatchMode,
    /// Batches larger than this are chunked when `dispatch` is `Chunked`.
    pub chunk_threshold: usize,
    pub workers: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            interval: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(2),
            poll_interval: Duration::from_secs(5),
            gate_concurrency: 16,
            dispatch: DispatchMode::PerFile,
            chunk_threshold: 10,
            workers: 1,
        }
    }
}

/// Counters for one scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    pub submitted: usize,
    pub timed_out: usize,
    pub vanished: usize,
    pub failed: usize,
    pub rejected: usize,
    pub chunked: bool,
    /// Earliest `enqueued_at` among the submitted jobs.
    pub first_enqueued_at: Option<DateTime<Utc>>,
}

/// Regular files in `input_dir` that are not already owned by the pipeline,
/// oldest modification first.
pub async fn discover(
    fs: &dyn FileSystem,
    input_dir: &Path,
    queue: &DispatchQueue,
) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs.list_files(input_dir).await?;
    entries.retain(|entry| !queue.is_in_flight(&entry.path));
    entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(entries.into_iter().map(|entry| entry.path).collect())
}

/// Split `items` into contiguous chunks of `ceil(len / workers)`.
pub fn plan_chunks<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = items.len().div_ceil(workers.max(1));
    let mut chunks = Vec::with_capacity(workers);
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    chunks
}

/// Log a gate result and return the job if it may be submitted.
pub(crate) fn sort_admission(
    scanner: &'static str,
    admission: Admission,
    report: &mut ScanReport,
) -> Option<Job> {
    match admission {
        Admission::Admitted(job) => Some(job),
        Admission::TimedOut { job, elapsed } => {
            report.timed_out += 1;
            warn!(
                target: "ingest",
                scanner,
                file = %job.file_name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "file still changing; left in place for the next scan"
            );
            None
        }
        Admission::Vanished(job) => {
            report.vanished += 1;
            debug!(
                target: "ingest",
                scanner,
                file = %job.file_name(),
                "file vanished before it settled"
            );
            None
        }
        Admission::Failed { job, error } => {
            report.failed += 1;
            warn!(
                target: "ingest",
                scanner,
                file = %job.file_name(),
                error = %error,
                "could not check file stability"
            );
            None
        }
    }
}

/// Submit admitted jobs, chunked or one by one.
pub(crate) fn submit_all(
    queue: &DispatchQueue,
    jobs: Vec<Job>,
    chunked: bool,
    workers: usize,
    report: &mut ScanReport,
) {
    if chunked {
        for chunk in plan_chunks(jobs, workers) {
            let (accepted, rejected) = queue.submit_chunk(chunk);
            report.submitted += accepted;
            for err in rejected {
                report.rejected += 1;
                debug!(target: "ingest", error = %err, "job not submitted");
            }
        }
        return;
    }

    for job in jobs {
        match queue.submit(job) {
            Ok(()) => report.submitted += 1,
            Err(err) => {
                report.rejected += 1;
                debug!(target: "ingest", error = %err, "job not submitted");
            }
        }
    }
}
