//! Contracts between the pipeline and its external collaborators.
//!
//! The executor only relies on these types and traits. Reference
//! implementations live in [`crate::klarf`] and [`crate::cluster`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A parsed report file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructuredReport {
    pub source: PathBuf,
    /// Header fields addressable from output templates (`loader_name`, `lot_id`, ...).
    pub fields: BTreeMap<String, String>,
    pub wafers: Vec<WaferMap>,
    /// Zero-based line indices of every defect record spec in `raw`.
    pub record_spec_lines: Vec<usize>,
    /// The original text, kept so outputs can be derived from it.
    pub raw: String,
}

impl StructuredReport {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn defect_count(&self) -> usize {
        self.wafers.iter().map(|wafer| wafer.defects.len()).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaferMap {
    pub wafer_id: String,
    pub defects: Vec<Defect>,
}

/// One defect row. `line` points back into [`StructuredReport::raw`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Defect {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub line: usize,
}

/// What the analysis engine produced for one wafer.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRecord {
    pub wafer_id: String,
    pub lot_id: Option<String>,
    pub clusters: usize,
    pub defects: usize,
    pub clustering_time: Duration,
    pub output_time: Duration,
    pub output_path: Option<PathBuf>,
}

/// Layout of generated output files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// The full source text with the cluster attribute column appended.
    #[default]
    Full,
    /// Header plus defect id and cluster id only.
    Baby,
}

/// Clustering algorithm and its parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum Algorithm {
    /// Density clustering: neighbours within `eps`, cores need `min_samples`.
    Dbscan { eps: f64, min_samples: usize },
    /// Square buckets of side `cell`; dense buckets that touch form a cluster.
    Grid { cell: f64, min_samples: usize },
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Dbscan { .. } => "dbscan",
            Algorithm::Grid { .. } => "grid",
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Dbscan {
            eps: 4.0,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read report: {0}")]
    Io(#[from] io::Error),

    #[error("report is empty")]
    Empty,

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("missing {0} record")]
    MissingRecord(&'static str),
}

impl ParseError {
    pub fn malformed(line: usize, message: impl Into<String>) -> Self {
        ParseError::Malformed {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),

    #[error("invalid algorithm parameters: {0}")]
    InvalidParameters(String),

    #[error("analysis failed: {0}")]
    Failed(String),
}

/// Turns a report file into a [`StructuredReport`].
///
/// Called from a blocking thread; implementations may do synchronous IO.
pub trait ReportParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<StructuredReport, ParseError>;
}

/// Clusters a parsed report and writes its output artifacts under `output_dir`.
///
/// Called from a blocking thread. An empty result is a valid return value;
/// the executor decides what it means.
pub trait AnalysisEngine: Send + Sync {
    fn analyze(
        &self,
        report: &StructuredReport,
        output_dir: &Path,
        format: OutputFormat,
        algorithm: &Algorithm,
    ) -> Result<Vec<ResultRecord>, AnalysisError>;
}
