//! Per-file processing: stability re-check, parse, analyze, delete, or
//! quarantine on any failure.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::dispatch::JobRunner;
use crate::error::{FsOp, PipelineError, Result};
use crate::fs::FileSystem;
use crate::job::{Job, JobOutcome, JobState};
use crate::notify::FailureNotifier;
use crate::report::{
    Algorithm, AnalysisEngine, OutputFormat, ReportParser, ResultRecord, StructuredReport,
};
use crate::stability::{StabilityError, StabilityPolicy, await_stable};
use crate::template::OutputTemplate;

/// What the executor needs to know about directories and analysis.
#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub output: OutputTemplate,
    pub error_dir: PathBuf,
    pub stability: StabilityPolicy,
    pub format: OutputFormat,
    pub algorithm: Algorithm,
}

/// External capabilities the executor calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub fs: Arc<dyn FileSystem>,
    pub parser: Arc<dyn ReportParser>,
    pub engine: Arc<dyn AnalysisEngine>,
    pub notifier: FailureNotifier,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

/// Drives a single job to a terminal outcome. Errors never escape: every
/// failure ends as `Quarantined`, `TimedOut` or `Missing`.
#[derive(Clone, Debug)]
pub struct JobExecutor {
    collaborators: Collaborators,
    settings: Arc<ExecutorSettings>,
}

impl JobExecutor {
    pub fn new(collaborators: Collaborators, settings: ExecutorSettings) -> Self {
        Self {
            collaborators,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Process the file at `path` outside the queue.
    ///
    /// Only acts on a file actually present at `path`; calling it again after
    /// the file was deleted or quarantined returns [`JobOutcome::Missing`].
    pub async fn execute(&self, path: impl Into<PathBuf>) -> JobOutcome {
        let mut job = Job::discovered(path);
        // No gate in front of a direct call; the stability re-check below covers it.
        for state in [JobState::Stabilizing, JobState::Queued] {
            if let Err(err) = job.advance(state) {
                error!(target: "executor", error = %err, "could not prepare job");
                return JobOutcome::Missing;
            }
        }
        self.execute_job(job).await
    }

    /// Process a job taken off the dispatch queue.
    pub async fn execute_job(&self, mut job: Job) -> JobOutcome {
        let file = job.file_name();
        if !self.collaborators.fs.exists(job.path()).await {
            debug!(target: "executor", %file, "source no longer at its path; nothing to do");
            return JobOutcome::Missing;
        }

        match self.process(&mut job).await {
            Ok(records) => {
                self.finish(&mut job, JobState::Completed);
                info!(
                    target: "executor",
                    %file,
                    job = %job.id,
                    records = records.len(),
                    "report processed"
                );
                JobOutcome::Completed { records }
            }
            Err(err) if err.is_quarantinable() => self.quarantine(job, err).await,
            Err(PipelineError::StabilityTimeout { elapsed, .. }) => {
                self.finish(&mut job, JobState::TimedOut);
                warn!(
                    target: "executor",
                    %file,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "file still changing; left in place for the next scan"
                );
                JobOutcome::TimedOut
            }
            Err(err) => {
                debug!(target: "executor", %file, error = %err, "source vanished during stability check");
                JobOutcome::Missing
            }
        }
    }

    async fn process(&self, job: &mut Job) -> Result<Vec<ResultRecord>> {
        job.advance(JobState::Processing)?;
        let path = job.source_path.clone();
        let fs = &self.collaborators.fs;

        await_stable(fs.as_ref(), &path, &self.settings.stability)
            .await
            .map_err(|err| match err {
                StabilityError::TimedOut { elapsed } => PipelineError::StabilityTimeout {
                    path: path.clone(),
                    elapsed,
                },
                StabilityError::Vanished => PipelineError::Vanished(path.clone()),
                StabilityError::Io(source) => PipelineError::filesystem(FsOp::Read, &path, source),
            })?;

        let report = self.parse(&path).await?;
        let output_dir = self.settings.output.resolve(|name| report.field(name))?;
        fs.create_dir_all(&output_dir)
            .await
            .map_err(|source| PipelineError::filesystem(FsOp::CreateDir, &output_dir, source))?;

        let records = self.analyze(report, output_dir).await?;
        let file = job.file_name();
        for record in &records {
            info!(
                target: "executor",
                %file,
                wafer = %record.wafer_id,
                lot = record.lot_id.as_deref().unwrap_or("-"),
                clusters = record.clusters,
                defects = record.defects,
                clustering_ms = record.clustering_time.as_millis() as u64,
                output_ms = record.output_time.as_millis() as u64,
                "wafer processed"
            );
        }

        if records.is_empty() {
            return Err(PipelineError::EmptyResult(path));
        }
        if !fs.exists(&path).await {
            return Err(PipelineError::SourceMissing(path));
        }
        fs.remove_file(&path)
            .await
            .map_err(|source| PipelineError::filesystem(FsOp::Remove, &path, source))?;
        Ok(records)
    }

    async fn parse(&self, path: &Path) -> Result<StructuredReport> {
        let parser = Arc::clone(&self.collaborators.parser);
        let path = path.to_path_buf();
        let report = tokio::task::spawn_blocking(move || parser.parse(&path))
            .await
            .map_err(|err| PipelineError::Internal(format!("parser task failed: {err}")))??;
        Ok(report)
    }

    async fn analyze(
        &self,
        report: StructuredReport,
        output_dir: PathBuf,
    ) -> Result<Vec<ResultRecord>> {
        let engine = Arc::clone(&self.collaborators.engine);
        let settings = Arc::clone(&self.settings);
        let records = tokio::task::spawn_blocking(move || {
            engine.analyze(&report, &output_dir, settings.format, &settings.algorithm)
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("analysis task failed: {err}")))??;
        Ok(records)
    }

    /// Move the source into the error directory (if it is still there), try
    /// to alert, and log the failure as critical either way.
    async fn quarantine(&self, mut job: Job, err: PipelineError) -> JobOutcome {
        let file = job.file_name();
        let fs = &self.collaborators.fs;
        let error_dir = &self.settings.error_dir;
        let target = error_dir.join(&file);

        if fs.exists(job.path()).await {
            // The error directory may have been removed while running.
            if let Err(source) = fs.create_dir_all(error_dir).await {
                warn!(
                    target: "quarantine",
                    path = %error_dir.display(),
                    error = %source,
                    "could not recreate error directory"
                );
            }
            match fs.rename(job.path(), &target).await {
                Ok(()) => debug!(
                    target: "quarantine",
                    %file,
                    to = %target.display(),
                    "moved to error directory"
                ),
                Err(source) => {
                    let failure = PipelineError::filesystem(FsOp::Move, job.path(), source);
                    error!(
                        target: "quarantine",
                        %file,
                        to = %target.display(),
                        error = %failure,
                        critical = true,
                        "file stays in input"
                    );
                }
            }
        }

        let message = self
            .collaborators
            .notifier
            .notify_failure(&file, error_dir)
            .await;
        error!(
            target: "quarantine",
            %file,
            error_path = %error_dir.display(),
            error = %err,
            critical = true,
            "{message}"
        );

        self.finish(&mut job, JobState::Quarantined);
        JobOutcome::Quarantined {
            reason: err.to_string(),
        }
    }

    fn finish(&self, job: &mut Job, state: JobState) {
        if let Err(err) = job.advance(state) {
            warn!(target: "executor", error = %err, "unexpected job state");
        }
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(&self, job: Job) -> JobOutcome {
        self.execute_job(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::testing::{EngineScript, RecordingTransport, ScriptedEngine, ScriptedParser};
    use std::time::Duration;

    struct Harness {
        fs: InMemoryFs,
        parser: Arc<ScriptedParser>,
        engine: Arc<ScriptedEngine>,
        transport: Arc<RecordingTransport>,
        executor: JobExecutor,
    }

    fn harness(engine: ScriptedEngine) -> Harness {
        let fs = InMemoryFs::new();
        fs.add_dir("/in");
        fs.add_dir("/error");
        let parser = Arc::new(ScriptedParser::default());
        let engine = Arc::new(engine);
        let transport = Arc::new(RecordingTransport::new());
        let executor = JobExecutor::new(
            Collaborators {
                fs: Arc::new(fs.clone()),
                parser: parser.clone(),
                engine: engine.clone(),
                notifier: FailureNotifier::new(transport.clone(), Default::default()),
            },
            ExecutorSettings {
                output: OutputTemplate::new("/out/{loader_name}"),
                error_dir: PathBuf::from("/error"),
                stability: StabilityPolicy {
                    timeout: Duration::from_secs(3),
                    sample_interval: Duration::from_secs(1),
                },
                format: OutputFormat::Full,
                algorithm: Algorithm::default(),
            },
        );
        Harness {
            fs,
            parser,
            engine,
            transport,
            executor,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_deletes_source() {
        let h = harness(ScriptedEngine::new(EngineScript::Records(2)));
        h.fs.add_file("/in/a.klarf", 100);

        let outcome = h.executor.execute("/in/a.klarf").await;

        let JobOutcome::Completed { records } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(records.len(), 2);
        assert!(!h.fs.contains(Path::new("/in/a.klarf")));
        assert!(h.fs.file_names(Path::new("/error")).is_empty());
        assert!(h.fs.contains(Path::new("/out/LOADER01")));
        assert_eq!(h.engine.calls()[0].1, PathBuf::from("/out/LOADER01"));
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failure_is_quarantined_and_alerted() {
        let h = harness(ScriptedEngine::default());
        h.fs.add_file("/in/bad.klarf", 100);
        h.parser.fail_on("bad.klarf");

        let outcome = h.executor.execute("/in/bad.klarf").await;

        assert!(matches!(outcome, JobOutcome::Quarantined { .. }));
        assert_eq!(h.fs.file_names(Path::new("/error")), vec!["bad.klarf"]);
        assert!(h.fs.file_names(Path::new("/in")).is_empty());
        assert_eq!(h.transport.subjects(), vec!["Clustering - Error on bad.klarf"]);
        assert!(h.transport.bodies()[0].contains("bad.klarf processing failed, moved to /error"));
        assert_eq!(h.engine.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_result_is_a_failure() {
        let h = harness(ScriptedEngine::new(EngineScript::Empty));
        h.fs.add_file("/in/a.klarf", 100);

        let outcome = h.executor.execute("/in/a.klarf").await;

        let JobOutcome::Quarantined { reason } = outcome else {
            panic!("expected quarantine, got {outcome:?}");
        };
        assert!(reason.contains("no result records"), "{reason}");
        assert_eq!(h.fs.file_names(Path::new("/error")), vec!["a.klarf"]);
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_survives_alert_failure() {
        let h = harness(ScriptedEngine::new(EngineScript::Fail("boom".into())));
        h.fs.add_file("/in/a.klarf", 100);
        h.transport.fail_sends(true);

        let outcome = h.executor.execute("/in/a.klarf").await;

        assert!(matches!(outcome, JobOutcome::Quarantined { .. }));
        assert_eq!(h.transport.attempts(), 1);
        assert_eq!(h.fs.file_names(Path::new("/error")), vec!["a.klarf"]);
        assert!(!h.fs.contains(Path::new("/in/a.klarf")));
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_overwrites_same_name_in_error_dir() {
        let h = harness(ScriptedEngine::new(EngineScript::Fail("boom".into())));
        h.fs.add_file("/error/a.klarf", 1);
        h.fs.add_file("/in/a.klarf", 100);

        h.executor.execute("/in/a.klarf").await;

        assert_eq!(h.fs.file_names(Path::new("/error")), vec!["a.klarf"]);
        assert!(!h.fs.contains(Path::new("/in/a.klarf")));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_template_field_is_quarantined() {
        let h = harness(ScriptedEngine::default());
        let executor = JobExecutor::new(
            Collaborators {
                parser: Arc::new(ScriptedParser::with_fields([("lot_id", "LOT1")])),
                ..h.executor.collaborators.clone()
            },
            h.executor.settings().clone(),
        );
        h.fs.add_file("/in/a.klarf", 100);

        let outcome = executor.execute("/in/a.klarf").await;

        let JobOutcome::Quarantined { reason } = outcome else {
            panic!("expected quarantine, got {outcome:?}");
        };
        assert!(reason.contains("loader_name"), "{reason}");
        assert_eq!(h.engine.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn executing_a_relocated_file_is_a_no_op() {
        let h = harness(ScriptedEngine::new(EngineScript::Fail("boom".into())));
        h.fs.add_file("/in/a.klarf", 100);

        h.executor.execute("/in/a.klarf").await;
        let again = h.executor.execute("/in/a.klarf").await;

        assert!(matches!(again, JobOutcome::Missing));
        assert_eq!(h.parser.calls(), 1);
        assert_eq!(h.transport.attempts(), 1);
        assert_eq!(h.fs.file_names(Path::new("/error")), vec!["a.klarf"]);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_panic_is_quarantined_and_alerted_once() {
        let h = harness(ScriptedEngine::new(EngineScript::Panic));
        h.fs.add_file("/in/a.klarf", 100);

        let outcome = h.executor.execute("/in/a.klarf").await;

        let JobOutcome::Quarantined { reason } = outcome else {
            panic!("expected quarantine, got {outcome:?}");
        };
        assert!(reason.contains("analysis task failed"), "{reason}");
        assert_eq!(h.fs.file_names(Path::new("/error")), vec!["a.klarf"]);
        assert!(h.fs.file_names(Path::new("/in")).is_empty());
        assert_eq!(h.engine.call_count(), 1);
        assert_eq!(h.transport.attempts(), 1);
        assert_eq!(h.transport.subjects(), vec!["Clustering - Error on a.klarf"]);
    }

    #[tokio::test(start_paused = true)]
    async fn growing_file_times_out_without_being_touched() {
        let h = harness(ScriptedEngine::default());
        let path = PathBuf::from("/in/busy.klarf");
        h.fs.add_file(&path, 1);

        let writer = {
            let fs = h.fs.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let mut len = 1;
                loop {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    len += 1;
                    fs.set_len(&path, len);
                }
            })
        };

        let outcome = h.executor.execute(&path).await;
        writer.abort();

        assert!(matches!(outcome, JobOutcome::TimedOut));
        assert!(h.fs.contains(&path));
        assert!(h.fs.file_names(Path::new("/error")).is_empty());
        assert_eq!(h.parser.calls(), 0);
        assert_eq!(h.transport.attempts(), 0);
    }
}
