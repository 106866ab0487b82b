use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::report::ResultRecord;

/// Unique identifier for pipeline jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single report file.
///
/// The stability gate owns `Discovered -> Stabilizing -> Queued`; the worker
/// holding the job owns `Queued -> Processing -> {Completed | Quarantined | TimedOut}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Discovered,
    Stabilizing,
    Queued,
    Processing,
    Completed,
    Quarantined,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Quarantined | JobState::TimedOut
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Discovered, Stabilizing)
                | (Stabilizing, Queued)
                | (Stabilizing, TimedOut)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Quarantined)
                | (Processing, TimedOut)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Discovered => "discovered",
            JobState::Stabilizing => "stabilizing",
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Quarantined => "quarantined",
            JobState::TimedOut => "timed_out",
        };
        f.write_str(label)
    }
}

/// One unit of work: a report file travelling through the pipeline.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub source_path: PathBuf,
    pub enqueued_at: DateTime<Utc>,
    state: JobState,
}

impl Job {
    /// Create a job for a file the scanner just found.
    pub fn discovered(source_path: impl Into<PathBuf>) -> Self {
        Self {
            id: JobId::new(),
            source_path: source_path.into(),
            enqueued_at: Utc::now(),
            state: JobState::Discovered,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move the job to `next`, rejecting transitions the lifecycle forbids.
    pub fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::Internal(format!(
                "illegal job transition {} -> {} for {}",
                self.state,
                next,
                self.source_path.display()
            )));
        }
        if next == JobState::Queued {
            self.enqueued_at = Utc::now();
        }
        self.state = next;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.source_path
    }

    /// File name used in logs, alerts and the error directory.
    pub fn file_name(&self) -> String {
        file_name_of(&self.source_path)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// How the executor resolved a job.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    /// Results were produced and the source file was deleted.
    Completed { records: Vec<ResultRecord> },
    /// The source file was relocated to the error directory and an alert attempted.
    Quarantined { reason: String },
    /// The file was still changing; it stays in the input directory for a later scan.
    TimedOut,
    /// The source file was no longer at its expected path; nothing was done.
    Missing,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed { .. } => "completed",
            JobOutcome::Quarantined { .. } => "quarantined",
            JobOutcome::TimedOut => "timed_out",
            JobOutcome::Missing => "missing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_happy_path() {
        let mut job = Job::discovered("/in/lot.klarf");
        for state in [
            JobState::Stabilizing,
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
        ] {
            job.advance(state).unwrap();
        }
        assert!(job.state().is_terminal());
        assert_eq!(job.file_name(), "lot.klarf");
    }

    #[test]
    fn rejects_skipping_the_gate() {
        let mut job = Job::discovered("/in/lot.klarf");
        assert!(job.advance(JobState::Processing).is_err());
        assert_eq!(job.state(), JobState::Discovered);
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobState::Completed, JobState::Quarantined, JobState::TimedOut] {
            for next in [JobState::Queued, JobState::Processing, JobState::Completed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
