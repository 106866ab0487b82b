use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::report::{AnalysisError, ParseError};
use crate::template::TemplateError;

/// Filesystem operation that failed while resolving a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsOp {
    Read,
    Remove,
    Move,
    CreateDir,
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsOp::Read => write!(f, "read"),
            FsOp::Remove => write!(f, "remove"),
            FsOp::Move => write!(f, "move"),
            FsOp::CreateDir => write!(f, "create directory"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{} did not stop changing within {elapsed:?}", path.display())]
    StabilityTimeout { path: PathBuf, elapsed: Duration },

    #[error("{} vanished before it could be processed", .0.display())]
    Vanished(PathBuf),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Output path error: {0}")]
    Template(#[from] TemplateError),

    #[error("analysis produced no result records for {}", .0.display())]
    EmptyResult(PathBuf),

    #[error("{} disappeared before it could be removed", .0.display())]
    SourceMissing(PathBuf),

    #[error("failed to {op} {}: {source}", path.display())]
    Filesystem {
        op: FsOp,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn filesystem(op: FsOp, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether the failure sends the source file to the error directory.
    ///
    /// Stability timeouts are retried by a later scan and a vanished source
    /// has nothing left to relocate.
    pub fn is_quarantinable(&self) -> bool {
        !matches!(
            self,
            PipelineError::StabilityTimeout { .. } | PipelineError::Vanished(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_and_vanished_are_not_quarantined() {
        let timeout = PipelineError::StabilityTimeout {
            path: PathBuf::from("/in/a.klarf"),
            elapsed: Duration::from_secs(11),
        };
        assert!(!timeout.is_quarantinable());
        assert!(!PipelineError::Vanished(PathBuf::from("/in/a.klarf")).is_quarantinable());

        assert!(PipelineError::EmptyResult(PathBuf::from("/in/a.klarf")).is_quarantinable());
        let fs = PipelineError::filesystem(
            FsOp::Remove,
            "/in/a.klarf",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(fs.is_quarantinable());
        assert!(fs.to_string().starts_with("failed to remove /in/a.klarf"));

        let moved = PipelineError::filesystem(
            FsOp::Move,
            "/in/a.klarf",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(moved.to_string().starts_with("failed to move /in/a.klarf"));
    }
}
