//! Write-completion heuristic for files dropped into the hot folder.
//!
//! Producers write reports non-atomically, so a file is only admitted once
//! two consecutive size samples agree. This is not a lock: a writer that
//! pauses for longer than one sample interval will be taken as finished.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::fs::FileSystem;
use crate::job::{Job, JobState};

/// Sampling policy for the stability gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StabilityPolicy {
    /// Give up once the file has kept changing for this long.
    pub timeout: Duration,
    /// Delay between two size samples.
    pub sample_interval: Duration,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            sample_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum StabilityError {
    #[error("file size still changing after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("file vanished while sampling")]
    Vanished,

    #[error("failed to stat file: {0}")]
    Io(#[source] io::Error),
}

/// Wait until the byte length of `path` stops changing. Returns the settled length.
pub async fn await_stable(
    fs: &dyn FileSystem,
    path: &Path,
    policy: &StabilityPolicy,
) -> Result<u64, StabilityError> {
    let started = Instant::now();
    let mut size = sample(fs, path).await?;

    loop {
        sleep(policy.sample_interval).await;
        let next = sample(fs, path).await?;
        if next == size {
            return Ok(next);
        }

        let elapsed = started.elapsed();
        if elapsed > policy.timeout {
            return Err(StabilityError::TimedOut { elapsed });
        }
        size = next;
    }
}

async fn sample(fs: &dyn FileSystem, path: &Path) -> Result<u64, StabilityError> {
    match fs.metadata(path).await {
        Ok(md) if md.is_file => Ok(md.len),
        // Replaced by a directory (or something stranger): the file we saw is gone.
        Ok(_) => Err(StabilityError::Vanished),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StabilityError::Vanished),
        Err(err) => Err(StabilityError::Io(err)),
    }
}

/// Result of running a discovered job through the gate.
#[derive(Debug)]
pub enum Admission {
    /// Settled; the job is now `Queued`.
    Admitted(Job),
    /// Still changing after the timeout; the file stays where it is.
    TimedOut { job: Job, elapsed: Duration },
    /// The file disappeared while being sampled.
    Vanished(Job),
    /// The file could not be sampled.
    Failed { job: Job, error: StabilityError },
}

/// Admits discovered jobs once their file has settled.
#[derive(Clone)]
pub struct StabilityGate {
    fs: Arc<dyn FileSystem>,
    policy: StabilityPolicy,
}

impl std::fmt::Debug for StabilityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityGate")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StabilityGate {
    pub fn new(fs: Arc<dyn FileSystem>, policy: StabilityPolicy) -> Self {
        Self { fs, policy }
    }

    pub fn policy(&self) -> &StabilityPolicy {
        &self.policy
    }

    pub async fn admit(&self, mut job: Job) -> Admission {
        if let Err(err) = job.advance(JobState::Stabilizing) {
            // Only freshly discovered jobs reach the gate.
            warn!(target: "ingest::gate", error = %err, "job handed to gate in wrong state");
            return Admission::Failed {
                job,
                error: StabilityError::Io(io::Error::other(err.to_string())),
            };
        }

        match await_stable(self.fs.as_ref(), &job.source_path, &self.policy).await {
            Ok(len) => {
                // Stabilizing -> Queued is always legal.
                let _ = job.advance(JobState::Queued);
                debug!(target: "ingest::gate", file = %job.file_name(), bytes = len, "file settled");
                Admission::Admitted(job)
            }
            Err(StabilityError::TimedOut { elapsed }) => {
                let _ = job.advance(JobState::TimedOut);
                Admission::TimedOut { job, elapsed }
            }
            Err(StabilityError::Vanished) => Admission::Vanished(job),
            Err(error) => Admission::Failed { job, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use std::path::PathBuf;

    fn policy(timeout_secs: u64) -> StabilityPolicy {
        StabilityPolicy {
            timeout: Duration::from_secs(timeout_secs),
            sample_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settled_file_passes_after_one_interval() {
        let fs = InMemoryFs::new();
        fs.add_file("/in/a.klarf", 42);

        let started = Instant::now();
        let len = await_stable(&fs, Path::new("/in/a.klarf"), &policy(10))
            .await
            .unwrap();
        assert_eq!(len, 42);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn growing_file_is_admitted_only_after_it_stops() {
        let fs = InMemoryFs::new();
        let path = PathBuf::from("/in/growing.klarf");
        fs.add_file(&path, 0);

        let writer = {
            let fs = fs.clone();
            let path = path.clone();
            tokio::spawn(async move {
                for step in 1..=6u64 {
                    sleep(Duration::from_millis(500)).await;
                    fs.set_len(&path, step * 100);
                }
            })
        };

        let started = Instant::now();
        let len = await_stable(&fs, &path, &policy(10)).await.unwrap();
        writer.await.unwrap();

        assert_eq!(len, 600);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn endlessly_growing_file_times_out_and_is_left_alone() {
        let fs = InMemoryFs::new();
        let path = PathBuf::from("/in/busy.klarf");
        fs.add_file(&path, 1);

        let writer = {
            let fs = fs.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let mut len = 1;
                loop {
                    sleep(Duration::from_millis(300)).await;
                    len += 1;
                    fs.set_len(&path, len);
                }
            })
        };

        let gate = StabilityGate::new(Arc::new(fs.clone()), policy(3));
        let admission = gate.admit(Job::discovered(&path)).await;
        writer.abort();

        match admission {
            Admission::TimedOut { job, elapsed } => {
                assert!(elapsed > Duration::from_secs(3));
                assert_eq!(job.state(), JobState::TimedOut);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(fs.contains(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_file_is_reported_as_vanished() {
        let fs = InMemoryFs::new();
        let path = PathBuf::from("/in/gone.klarf");
        fs.add_file(&path, 5);

        let remover = {
            let fs = fs.clone();
            let path = path.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(500)).await;
                fs.remove(&path);
            })
        };

        let result = await_stable(&fs, &path, &policy(10)).await;
        remover.await.unwrap();
        assert!(matches!(result, Err(StabilityError::Vanished)));
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_jobs_are_queued() {
        let fs = InMemoryFs::new();
        fs.add_file("/in/a.klarf", 7);
        let gate = StabilityGate::new(Arc::new(fs), policy(10));

        match gate.admit(Job::discovered("/in/a.klarf")).await {
            Admission::Admitted(job) => assert_eq!(job.state(), JobState::Queued),
            other => panic!("expected admission, got {other:?}"),
        }
    }
}
