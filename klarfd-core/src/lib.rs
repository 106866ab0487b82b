//! # klarfd core
//!
//! Hot-folder pipeline for KLARF inspection reports. Files dropped into the
//! input directory are gated until their size stops changing, handed to a
//! fixed pool of workers, parsed and clustered, and then either deleted
//! (success) or moved to the error directory with an operator alert.
//!
//! ## Feature Flags
//!
//! - `watch` (default): filesystem-event scanner built on `notify`
//! - `test-utils`: scripted parser, engine and alert transport
//!
//! ## Architecture
//!
//! - [`ingest`]: batch and watch scanners feeding the queue
//! - [`stability`]: write-completion gate
//! - [`dispatch`]: dispatch queue and supervised worker pool
//! - [`executor`]: per-file processing and quarantine
//! - [`notify`]: failure alerts and the SMTP transport
//! - [`pipeline`]: wiring and shutdown
//! - [`klarf`] and [`cluster`]: reference parser and analysis engine
//!
//! ```no_run
//! use std::sync::Arc;
//! use klarfd_core::{
//!     Collaborators, FailureNotifier, Pipeline, PipelineSettings, RealFs,
//!     cluster::ClusteringEngine, klarf::KlarfParser,
//! };
//!
//! async fn run(settings: PipelineSettings) -> Result<(), Box<dyn std::error::Error>> {
//!     let collaborators = Collaborators {
//!         fs: Arc::new(RealFs::new()),
//!         parser: Arc::new(KlarfParser::new()),
//!         engine: Arc::new(ClusteringEngine::default()),
//!         notifier: FailureNotifier::log_only(),
//!     };
//!     let handle = Pipeline::new(settings, collaborators).start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown(true).await;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fs;
pub mod ingest;
pub mod job;
pub mod klarf;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod stability;
pub mod template;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use dispatch::{DispatchQueue, PoolConfig, PoolStatsSnapshot, WorkerPool};
pub use error::{PipelineError, Result};
pub use executor::{Collaborators, ExecutorSettings, JobExecutor};
pub use fs::{FileSystem, InMemoryFs, RealFs};
pub use ingest::{DispatchMode, ScanSettings, ScannerMode};
pub use job::{Job, JobId, JobOutcome, JobState};
pub use notify::{AlertTransport, FailureNotifier, MailSettings};
pub use pipeline::{Pipeline, PipelineHandle, PipelineSettings};
pub use report::{
    Algorithm, AnalysisEngine, OutputFormat, ReportParser, ResultRecord, StructuredReport,
};
pub use stability::{StabilityGate, StabilityPolicy};
pub use template::OutputTemplate;
