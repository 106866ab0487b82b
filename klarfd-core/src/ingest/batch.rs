use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchQueue;
use crate::fs::FileSystem;
use crate::ingest::{
    DispatchMode, ScanReport, ScanSettings, discover, sort_admission, submit_all,
};
use crate::job::Job;
use crate::stability::StabilityGate;

/// Periodic directory listing.
///
/// Each scan gates every new file, submits the settled ones and waits for
/// the whole batch to resolve before the next scan.
pub struct BatchScanner {
    fs: Arc<dyn FileSystem>,
    gate: StabilityGate,
    queue: Arc<DispatchQueue>,
    settings: ScanSettings,
}

impl fmt::Debug for BatchScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchScanner")
            .field("gate", &self.gate)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BatchScanner {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        gate: StabilityGate,
        queue: Arc<DispatchQueue>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            fs,
            gate,
            queue,
            settings,
        }
    }

    /// List, gate and submit once. Does not wait for the jobs to finish.
    pub async fn scan_once(&self) -> io::Result<ScanReport> {
        let paths = discover(self.fs.as_ref(), &self.settings.input_dir, &self.queue).await?;
        let mut report = ScanReport {
            discovered: paths.len(),
            ..ScanReport::default()
        };
        if paths.is_empty() {
            return Ok(report);
        }

        let concurrency = self.settings.gate_concurrency.max(1);
        let admissions: Vec<_> = stream::iter(paths)
            .map(|path| self.gate.admit(Job::discovered(path)))
            .buffered(concurrency)
            .collect()
            .await;

        let admitted: Vec<Job> = admissions
            .into_iter()
            .filter_map(|admission| sort_admission("batch", admission, &mut report))
            .collect();

        report.first_enqueued_at = admitted.iter().map(|job| job.enqueued_at).min();
        report.chunked = self.settings.dispatch == DispatchMode::Chunked
            && admitted.len() > self.settings.chunk_threshold;
        submit_all(
            &self.queue,
            admitted,
            report.chunked,
            self.settings.workers,
            &mut report,
        );
        Ok(report)
    }

    /// Scan until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            target: "ingest::batch",
            input = %self.settings.input_dir.display(),
            "batch scanner started"
        );

        while !cancel.is_cancelled() {
            let report = match self.scan_once().await {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        target: "ingest::batch",
                        input = %self.settings.input_dir.display(),
                        error = %err,
                        "failed to list input directory"
                    );
                    if !pause(&cancel, self.settings.interval).await {
                        break;
                    }
                    continue;
                }
            };

            if report.discovered == 0 {
                // Nothing there; short pause so the loop never spins.
                if !pause(&cancel, self.settings.idle_sleep).await {
                    break;
                }
                continue;
            }

            if report.submitted > 0 {
                tokio::select! {
                    _ = self.queue.wait_idle() => {}
                    _ = cancel.cancelled() => break,
                }
                let elapsed = report
                    .first_enqueued_at
                    .and_then(|first| (Utc::now() - first).to_std().ok())
                    .unwrap_or_default();
                info!(
                    target: "ingest::batch",
                    files = report.submitted,
                    elapsed_ms = elapsed.as_millis() as u64,
                    chunked = report.chunked,
                    "batch of {} file(s) executed in {:.3}s [chunked={}]",
                    report.submitted,
                    elapsed.as_secs_f64(),
                    report.chunked
                );
            } else {
                debug!(target: "ingest::batch", ?report, "nothing admitted this scan");
            }

            if !pause(&cancel, self.settings.interval).await {
                break;
            }
        }

        info!(target: "ingest::batch", "batch scanner stopped");
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
