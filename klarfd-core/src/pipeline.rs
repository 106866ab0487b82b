//! Wiring and lifecycle: directory preparation, worker pool, scanner.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::{DispatchQueue, PoolConfig, PoolStatsSnapshot, WorkerPool};
use crate::error::{PipelineError, Result};
use crate::executor::{Collaborators, ExecutorSettings, JobExecutor};
use crate::ingest::batch::BatchScanner;
use crate::ingest::{ScanSettings, ScannerMode};
use crate::report::{Algorithm, OutputFormat};
use crate::stability::{StabilityGate, StabilityPolicy};
use crate::template::OutputTemplate;

/// Everything the running pipeline needs to know.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub output: OutputTemplate,
    pub error_dir: PathBuf,
    /// Extra directories prepared at startup.
    pub archive_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub stability: StabilityPolicy,
    /// Scanner cadence and dispatch policy; `scan.input_dir` is the hot folder.
    pub scan: ScanSettings,
    pub mode: ScannerMode,
    pub pool: PoolConfig,
    pub format: OutputFormat,
    pub algorithm: Algorithm,
}

impl PipelineSettings {
    pub fn input_dir(&self) -> &std::path::Path {
        &self.scan.input_dir
    }

    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            output: self.output.clone(),
            error_dir: self.error_dir.clone(),
            stability: self.stability,
            format: self.format,
            algorithm: self.algorithm.clone(),
        }
    }

    /// Directories that must exist before the first scan.
    fn required_directories(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.scan.input_dir.clone(),
            self.error_dir.clone(),
            self.output.static_prefix(),
        ];
        dirs.extend(
            [&self.archive_dir, &self.tmp_dir]
                .into_iter()
                .flatten()
                .cloned(),
        );
        dirs.retain(|dir| !dir.as_os_str().is_empty());
        dirs
    }
}

/// A configured pipeline that has not been started.
pub struct Pipeline {
    settings: PipelineSettings,
    collaborators: Collaborators,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("collaborators", &self.collaborators)
            .finish()
    }
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Prepare directories, start the workers and the scanner.
    ///
    /// Fails only when a directory cannot be created; nothing is running in
    /// that case.
    pub async fn start(self) -> Result<PipelineHandle> {
        let Pipeline {
            mut settings,
            collaborators,
        } = self;

        for dir in settings.required_directories() {
            collaborators.fs.create_dir_all(&dir).await.map_err(|err| {
                error!(
                    target: "pipeline",
                    path = %dir.display(),
                    error = %err,
                    critical = true,
                    "cannot prepare directory"
                );
                PipelineError::Setup(format!("cannot create {}: {err}", dir.display()))
            })?;
        }

        settings.pool.workers = settings.pool.workers.max(1);
        settings.scan.workers = settings.pool.workers;

        let queue = Arc::new(DispatchQueue::new());
        let executor = JobExecutor::new(collaborators.clone(), settings.executor_settings());
        let pool = WorkerPool::start(settings.pool, Arc::clone(&queue), Arc::new(executor));

        let gate = StabilityGate::new(Arc::clone(&collaborators.fs), settings.stability);
        let cancel = CancellationToken::new();
        let scanner = spawn_scanner(
            settings.mode,
            collaborators,
            gate,
            Arc::clone(&queue),
            settings.scan.clone(),
            cancel.clone(),
        );

        info!(
            target: "pipeline",
            input = %settings.scan.input_dir.display(),
            output = %settings.output.as_str(),
            error = %settings.error_dir.display(),
            mode = ?settings.mode,
            workers = settings.pool.workers,
            "pipeline started"
        );

        Ok(PipelineHandle {
            cancel,
            scanner,
            pool,
            queue,
        })
    }
}

fn spawn_scanner(
    mode: ScannerMode,
    collaborators: Collaborators,
    gate: StabilityGate,
    queue: Arc<DispatchQueue>,
    scan: ScanSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    match mode {
        #[cfg(feature = "watch")]
        ScannerMode::Watch => {
            let scanner =
                crate::ingest::watch::WatchScanner::new(collaborators.fs, gate, queue, scan);
            tokio::spawn(scanner.run(cancel))
        }
        #[cfg(not(feature = "watch"))]
        ScannerMode::Watch => {
            warn!(
                target: "pipeline",
                "built without filesystem events; using the batch scanner"
            );
            let scanner = BatchScanner::new(collaborators.fs, gate, queue, scan);
            tokio::spawn(scanner.run(cancel))
        }
        ScannerMode::Batch => {
            let scanner = BatchScanner::new(collaborators.fs, gate, queue, scan);
            tokio::spawn(scanner.run(cancel))
        }
    }
}

/// The only handle to a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    scanner: JoinHandle<()>,
    pool: WorkerPool,
    queue: Arc<DispatchQueue>,
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    pub fn queue(&self) -> Arc<DispatchQueue> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.pool.stats()
    }

    pub fn live_workers(&self) -> usize {
        self.pool.live_workers()
    }

    /// Stop scanning, then stop the workers. With `drain` every job already
    /// submitted is still executed.
    pub async fn shutdown(self, drain: bool) -> PoolStatsSnapshot {
        info!(target: "pipeline", drain, "stopping pipeline");
        self.cancel.cancel();
        if let Err(err) = self.scanner.await {
            warn!(target: "pipeline", error = %err, "scanner task ended abnormally");
        }
        let stats = self.pool.shutdown(drain).await;
        info!(target: "pipeline", %stats, "pipeline stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileSystem, InMemoryFs};
    use crate::notify::FailureNotifier;
    use crate::testing::{ScriptedEngine, ScriptedParser};
    use std::path::Path;
    use std::time::Duration;

    fn settings(output: &str) -> PipelineSettings {
        PipelineSettings {
            output: OutputTemplate::new(output),
            error_dir: PathBuf::from("/data/error"),
            archive_dir: Some(PathBuf::from("/data/archive")),
            tmp_dir: None,
            stability: StabilityPolicy {
                timeout: Duration::from_secs(3),
                sample_interval: Duration::from_millis(500),
            },
            scan: ScanSettings {
                input_dir: PathBuf::from("/data/input"),
                ..ScanSettings::default()
            },
            mode: ScannerMode::Batch,
            pool: PoolConfig {
                workers: 2,
                max_tasks_per_worker: None,
            },
            format: OutputFormat::Full,
            algorithm: Algorithm::default(),
        }
    }

    fn collaborators(fs: &InMemoryFs) -> Collaborators {
        Collaborators {
            fs: Arc::new(fs.clone()),
            parser: Arc::new(ScriptedParser::default()),
            engine: Arc::new(ScriptedEngine::default()),
            notifier: FailureNotifier::log_only(),
        }
    }

    #[test]
    fn only_the_static_output_prefix_is_prepared() {
        let dirs = settings("/data/output/{loader_name}/maps").required_directories();
        assert!(dirs.contains(&PathBuf::from("/data/output")));
        assert!(dirs.contains(&PathBuf::from("/data/archive")));
        assert!(!dirs.iter().any(|dir| dir.to_string_lossy().contains('{')));
    }

    #[tokio::test(start_paused = true)]
    async fn start_prepares_directories_and_processes_files() {
        let fs = InMemoryFs::new();
        let handle = Pipeline::new(settings("/data/output/{loader_name}"), collaborators(&fs))
            .start()
            .await
            .unwrap();

        for dir in ["/data/input", "/data/error", "/data/output", "/data/archive"] {
            assert!(fs.exists(Path::new(dir)).await, "{dir} missing");
        }

        fs.add_file("/data/input/a.klarf", 10);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = handle.shutdown(true).await;
        assert_eq!(stats.completed, 1);
        assert!(!fs.contains(Path::new("/data/input/a.klarf")));
        assert!(fs.exists(Path::new("/data/output/LOADER01")).await);
    }
}
