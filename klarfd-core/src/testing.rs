//! Scripted collaborators for exercising the pipeline without real reports.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cluster;
use crate::job::file_name_of;
use crate::notify::{AlertTransport, MailSettings, NotifyError};
use crate::report::{
    Algorithm, AnalysisEngine, AnalysisError, OutputFormat, ParseError, ReportParser,
    ResultRecord, StructuredReport, WaferMap,
};

/// Parser that never reads the file. Every report carries the same fields
/// and a single wafer; selected file names fail.
#[derive(Debug)]
pub struct ScriptedParser {
    fields: BTreeMap<String, String>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl Default for ScriptedParser {
    fn default() -> Self {
        Self::with_fields([("loader_name", "LOADER01"), ("lot_id", "LOT42")])
    }
}

impl ScriptedParser {
    pub fn with_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            failing: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_on(&self, file_name: &str) {
        self.failing.lock().insert(file_name.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReportParser for ScriptedParser {
    fn parse(&self, path: &Path) -> Result<StructuredReport, ParseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&file_name_of(path)) {
            return Err(ParseError::malformed(1, "scripted parse failure"));
        }
        Ok(StructuredReport {
            source: path.to_path_buf(),
            fields: self.fields.clone(),
            wafers: vec![WaferMap {
                wafer_id: "W01".into(),
                defects: Vec::new(),
            }],
            record_spec_lines: Vec::new(),
            raw: String::new(),
        })
    }
}

/// How [`ScriptedEngine`] answers for a given file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineScript {
    /// Return this many records.
    Records(usize),
    /// Return no records at all.
    Empty,
    /// Fail with this message.
    Fail(String),
    /// Delete the source file from disk, then return one record.
    DeleteSource,
    /// Panic inside the engine.
    Panic,
}

/// Analysis engine driven by per-file scripts.
///
/// Tracks every call and which sources are being analysed concurrently.
#[derive(Debug)]
pub struct ScriptedEngine {
    default: EngineScript,
    scripts: Mutex<HashMap<String, EngineScript>>,
    delay: Duration,
    write_outputs: AtomicBool,
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    running: Mutex<HashSet<PathBuf>>,
    overlaps: AtomicUsize,
    max_parallel: AtomicUsize,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(EngineScript::Records(1))
    }
}

impl ScriptedEngine {
    pub fn new(default: EngineScript) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            write_outputs: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            running: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            max_parallel: AtomicUsize::new(0),
        }
    }

    /// Block each call for `delay`, as a slow engine would.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Write `<stem>_clustered<ext>` into the output directory on success.
    pub fn writing_outputs(self) -> Self {
        self.write_outputs.store(true, Ordering::SeqCst);
        self
    }

    pub fn script(&self, file_name: &str, script: EngineScript) {
        self.scripts.lock().insert(file_name.to_string(), script);
    }

    /// `(source, output_dir)` for every call, in call order.
    pub fn calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Times a source was analysed while another call for it was running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel.load(Ordering::SeqCst)
    }

    fn answer(
        &self,
        script: EngineScript,
        report: &StructuredReport,
        output_dir: &Path,
    ) -> Result<Vec<ResultRecord>, AnalysisError> {
        let record = |index: usize| ResultRecord {
            wafer_id: format!("W{index:02}"),
            lot_id: report.field("lot_id").map(str::to_string),
            clusters: index + 1,
            defects: 10,
            clustering_time: Duration::from_millis(3),
            output_time: Duration::from_millis(1),
            output_path: Some(cluster::output_path(output_dir, &report.source)),
        };

        let records = match script {
            EngineScript::Records(count) => (0..count).map(record).collect(),
            EngineScript::Empty => return Ok(Vec::new()),
            EngineScript::Fail(message) => return Err(AnalysisError::Failed(message)),
            EngineScript::DeleteSource => {
                std::fs::remove_file(&report.source)?;
                vec![record(0)]
            }
            EngineScript::Panic => panic!("scripted engine panic"),
        };

        if self.write_outputs.load(Ordering::SeqCst) {
            std::fs::write(
                cluster::output_path(output_dir, &report.source),
                format!("clustered {}\n", report.source.display()),
            )?;
        }
        Ok(records)
    }
}

impl AnalysisEngine for ScriptedEngine {
    fn analyze(
        &self,
        report: &StructuredReport,
        output_dir: &Path,
        _format: OutputFormat,
        _algorithm: &Algorithm,
    ) -> Result<Vec<ResultRecord>, AnalysisError> {
        self.calls
            .lock()
            .push((report.source.clone(), output_dir.to_path_buf()));
        {
            let mut running = self.running.lock();
            if !running.insert(report.source.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.max_parallel.fetch_max(running.len(), Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let script = self
            .scripts
            .lock()
            .get(&file_name_of(&report.source))
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        let result = self.answer(script, report, output_dir);
        self.running.lock().remove(&report.source);
        result
    }
}

/// Transport that records alerts instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail as an unreachable server would.
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Subjects of alerts that were delivered.
    pub fn subjects(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(subject, _)| subject.clone()).collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, body)| body.clone()).collect()
    }
}

#[async_trait]
impl AlertTransport for RecordingTransport {
    async fn send(
        &self,
        _recipient: &MailSettings,
        subject: &str,
        html_body: &str,
    ) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted transport failure",
            )));
        }
        self.sent
            .lock()
            .push((subject.to_string(), html_body.to_string()));
        Ok(())
    }
}
