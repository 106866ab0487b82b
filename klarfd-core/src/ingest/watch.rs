use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinSet, spawn_blocking};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchQueue;
use crate::fs::FileSystem;
use crate::ingest::{ScanReport, ScanSettings, discover, sort_admission, submit_all};
use crate::job::Job;
use crate::stability::{Admission, StabilityGate};

const CHANNEL_CAPACITY: usize = 1024;

enum WatchMessage {
    Candidate(PathBuf),
    /// The watched directory itself was removed or renamed away. The
    /// subscription is dead even if a new directory appears at the path.
    RootGone,
    /// The event source dropped events and cannot say which.
    Rescan,
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Candidate(path) => f
                .debug_tuple("WatchMessage::Candidate")
                .field(path)
                .finish(),
            WatchMessage::RootGone => f.write_str("WatchMessage::RootGone"),
            WatchMessage::Rescan => f.write_str("WatchMessage::Rescan"),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

/// How a single gate task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateResult {
    Submitted,
    /// Still changing or could not be sampled; needs another sweep.
    Retry,
    Dropped,
}

/// Identity of the input directory as last seen. `identity` is `None` on
/// platforms without inode numbers; replacement is then only noticed
/// through events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RootState {
    identity: Option<(u64, u64)>,
}

/// Filesystem-event scanner with a polling fallback.
///
/// On start it sweeps the directory once for files that arrived before the
/// subscription. Each create/rename-into event gates that one file. A
/// periodic health check drops the subscription while the directory is
/// gone and resubscribes (followed by a sweep) once it is back, or as soon
/// as a different directory has taken its place. When no subscription can
/// be made the scanner sweeps on `poll_interval` instead.
///
/// A sweep is also scheduled when the watcher loses events or the root
/// disappears, when a stability check gives up, and when a worker leaves
/// a file in the input directory without resolving it.
pub struct WatchScanner {
    fs: Arc<dyn FileSystem>,
    gate: StabilityGate,
    queue: Arc<DispatchQueue>,
    settings: ScanSettings,
    stabilizing: Arc<DashSet<PathBuf>>,
}

impl fmt::Debug for WatchScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchScanner")
            .field("gate", &self.gate)
            .field("settings", &self.settings)
            .field("stabilizing", &self.stabilizing.len())
            .finish_non_exhaustive()
    }
}

impl WatchScanner {
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
            stabilizing: Arc::new(DashSet::new()),
        }
    }

    /// Watch until `cancel` fires. Gate checks still running are abandoned;
    /// their files stay in the input directory.
    pub async fn run(self, cancel: CancellationToken) {
        let input = self.settings.input_dir.clone();
        info!(target: "ingest::watch", input = %input.display(), "watch scanner started");

        let (tx, mut rx) = mpsc::channel::<WatchMessage>(CHANNEL_CAPACITY);
        let mut gates: JoinSet<GateResult> = JoinSet::new();
        let mut root = self.root_state().await;
        let mut watcher = if root.is_some() {
            subscribe(&input, &tx).await
        } else {
            None
        };
        let mut retry_pending = false;

        if root.is_some() {
            self.sweep(&mut gates).await;
        } else {
            warn!(target: "ingest::watch", input = %input.display(), "input directory missing");
        }

        let mut health = interval(self.settings.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately; the startup sweep already ran.
        health.tick().await;
        poll.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(message) = rx.recv() => match message {
                    WatchMessage::Candidate(path) => self.spawn_gate(&mut gates, path),
                    WatchMessage::RootGone => {
                        warn!(
                            target: "ingest::watch",
                            input = %input.display(),
                            "input directory removed or renamed; dropping subscription"
                        );
                        watcher = None;
                        retry_pending = true;
                    }
                    WatchMessage::Rescan => {
                        warn!(target: "ingest::watch", "watcher lost events; sweep scheduled");
                        retry_pending = true;
                    }
                    WatchMessage::Error(message) => {
                        warn!(target: "ingest::watch", error = %message, "watcher reported an error");
                        retry_pending = true;
                    }
                },

                _ = self.queue.rescan_requested() => {
                    debug!(target: "ingest::watch", "a worker left a file in place; sweep scheduled");
                    retry_pending = true;
                }

                Some(joined) = gates.join_next(), if !gates.is_empty() => {
                    if matches!(joined, Ok(GateResult::Retry)) {
                        retry_pending = true;
                    }
                }

                _ = health.tick() => {
                    let current = self.root_state().await;
                    match (root, current) {
                        (Some(_), None) => {
                            warn!(
                                target: "ingest::watch",
                                input = %input.display(),
                                "input directory vanished; pausing subscription"
                            );
                            watcher = None;
                        }
                        (None, Some(_)) => {
                            info!(
                                target: "ingest::watch",
                                input = %input.display(),
                                "input directory is back; resubscribing"
                            );
                            watcher = subscribe(&input, &tx).await;
                            retry_pending = false;
                            self.sweep(&mut gates).await;
                        }
                        (Some(before), Some(now)) if before != now => {
                            info!(
                                target: "ingest::watch",
                                input = %input.display(),
                                "input directory was replaced; resubscribing"
                            );
                            watcher = subscribe(&input, &tx).await;
                            retry_pending = false;
                            self.sweep(&mut gates).await;
                        }
                        _ => {}
                    }
                    root = current;
                }

                _ = poll.tick(), if root.is_some() && (watcher.is_none() || retry_pending) => {
                    match self.root_state().await {
                        Some(now) => {
                            if watcher.is_none() || root != Some(now) {
                                watcher = subscribe(&input, &tx).await;
                            }
                            root = Some(now);
                            retry_pending = false;
                            self.sweep(&mut gates).await;
                        }
                        None => {
                            warn!(
                                target: "ingest::watch",
                                input = %input.display(),
                                "input directory vanished; pausing subscription"
                            );
                            watcher = None;
                            root = None;
                        }
                    }
                }
            }
        }

        gates.abort_all();
        drop(watcher);
        info!(target: "ingest::watch", "watch scanner stopped");
    }

    async fn root_state(&self) -> Option<RootState> {
        let metadata = self.fs.metadata(&self.settings.input_dir).await.ok()?;
        metadata.is_dir.then_some(RootState {
            identity: metadata.identity,
        })
    }

    /// Gate every file present that is not already owned or being checked.
    async fn sweep(&self, gates: &mut JoinSet<GateResult>) {
        match discover(self.fs.as_ref(), &self.settings.input_dir, &self.queue).await {
            Ok(paths) => {
                debug!(target: "ingest::watch", files = paths.len(), "sweeping input directory");
                for path in paths {
                    self.spawn_gate(gates, path);
                }
            }
            Err(err) => warn!(
                target: "ingest::watch",
                input = %self.settings.input_dir.display(),
                error = %err,
                "sweep failed"
            ),
        }
    }

    fn spawn_gate(&self, gates: &mut JoinSet<GateResult>, path: PathBuf) {
        if path.parent() != Some(self.settings.input_dir.as_path()) {
            return;
        }
        if self.queue.is_in_flight(&path) || !self.stabilizing.insert(path.clone()) {
            return;
        }

        let gate = self.gate.clone();
        let queue = Arc::clone(&self.queue);
        let stabilizing = Arc::clone(&self.stabilizing);
        gates.spawn(async move {
            let admission = gate.admit(Job::discovered(path.clone())).await;
            let retry = matches!(
                admission,
                Admission::TimedOut { .. } | Admission::Failed { .. }
            );

            let mut report = ScanReport::default();
            let result = match sort_admission("watch", admission, &mut report) {
                Some(job) => {
                    submit_all(&queue, vec![job], false, 1, &mut report);
                    if report.submitted == 1 {
                        GateResult::Submitted
                    } else {
                        GateResult::Dropped
                    }
                }
                None if retry => GateResult::Retry,
                None => GateResult::Dropped,
            };
            stabilizing.remove(&path);
            result
        });
    }
}

/// Subscribe to `input` on a blocking thread. `None` when the platform
/// watcher cannot be created; the caller polls instead.
async fn subscribe(input: &Path, tx: &mpsc::Sender<WatchMessage>) -> Option<RecommendedWatcher> {
    let root = input.to_path_buf();
    let tx = tx.clone();
    match spawn_blocking(move || init_watcher(root, tx)).await {
        Ok(Ok(watcher)) => Some(watcher),
        Ok(Err(err)) => {
            warn!(
                target: "ingest::watch",
                input = %input.display(),
                error = %err,
                "filesystem events unavailable; falling back to polling"
            );
            None
        }
        Err(join_err) => {
            warn!(
                target: "ingest::watch",
                error = %join_err,
                "watcher initialization panicked; falling back to polling"
            );
            None
        }
    }
}

fn init_watcher(
    root: PathBuf,
    tx: mpsc::Sender<WatchMessage>,
) -> notify::Result<RecommendedWatcher> {
    let root_for_events = root.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                for message in messages_for(&root_for_events, &event) {
                    if let Err(err) = tx.blocking_send(message) {
                        warn!(target: "ingest::watch", error = %err, "watch channel closed");
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Translate one raw event for the directory `root`.
fn messages_for(root: &Path, event: &Event) -> Vec<WatchMessage> {
    if event.need_rescan() {
        return vec![WatchMessage::Rescan];
    }
    let root_affected = matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    ) && event.paths.iter().any(|path| path == root);
    if root_affected {
        return vec![WatchMessage::RootGone];
    }
    candidate_paths(event)
        .into_iter()
        .map(WatchMessage::Candidate)
        .collect()
}

/// Paths that may be new report files after `event`.
fn candidate_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().cloned().into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            event.paths.clone()
        }
        _ => Vec::new(),
    }
}
