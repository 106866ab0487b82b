pub mod directories;

use std::collections::BTreeMap;
use std::time::Duration;

use klarfd_core::{
    Algorithm, DispatchMode, MailSettings, OutputFormat, PipelineSettings, PoolConfig,
    ScanSettings, ScannerMode, StabilityPolicy,
};
use serde::{Deserialize, Serialize};

pub use directories::{DirectoriesConfig, DirectoryOverrides, PlatformConfig};

/// Complete daemon configuration. Every section and field has a default, so
/// an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub directories: DirectoriesConfig,
    pub stability: StabilityConfig,
    pub scanner: ScannerConfig,
    pub workers: WorkersConfig,
    pub analysis: AnalysisConfig,
    pub mailing: MailingConfig,
    /// Directory overrides keyed by operating system (`linux`, `windows`, `macos`).
    pub platforms: BTreeMap<String, PlatformConfig>,
}

impl PipelineConfig {
    /// Apply the `platforms.<os>` overrides for `os`, if any.
    pub fn apply_platform(&mut self, os: &str) -> bool {
        match self.platforms.get(os) {
            Some(platform) => {
                let overrides = platform.directories.clone();
                self.directories.apply(overrides);
                true
            }
            None => false,
        }
    }

    /// Settings for [`klarfd_core::Pipeline`].
    pub fn to_pipeline_settings(&self) -> PipelineSettings {
        let workers = self.workers.count.max(1);
        PipelineSettings {
            output: self.directories.output.clone(),
            error_dir: self.directories.error.clone(),
            archive_dir: self.directories.archive.clone(),
            tmp_dir: self.directories.tmp.clone(),
            stability: self.stability.policy(),
            scan: ScanSettings {
                input_dir: self.directories.input.clone(),
                interval: Duration::from_millis(self.scanner.interval_ms),
                idle_sleep: Duration::from_millis(self.scanner.idle_sleep_ms),
                health_check_interval: Duration::from_millis(
                    self.scanner.health_check_interval_ms,
                ),
                poll_interval: Duration::from_millis(self.scanner.poll_interval_ms),
                gate_concurrency: self.scanner.gate_concurrency.max(1),
                dispatch: self.workers.dispatch,
                chunk_threshold: self.workers.chunk_threshold,
                workers,
            },
            mode: self.scanner.mode,
            pool: PoolConfig {
                workers,
                max_tasks_per_worker: self.workers.max_tasks_per_worker,
            },
            format: self.analysis.output_format,
            algorithm: self.analysis.algorithm(),
        }
    }
}

/// Write-completion check.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub timeout_secs: u64,
    pub sample_interval_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            sample_interval_ms: 1_000,
        }
    }
}

impl StabilityConfig {
    pub fn policy(&self) -> StabilityPolicy {
        StabilityPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }
}

/// How the input directory is watched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub mode: ScannerMode,
    /// Delay (ms) between two batch scans that found files.
    pub interval_ms: u64,
    /// Delay (ms) before listing an empty directory again.
    pub idle_sleep_ms: u64,
    /// How often (ms) watch mode checks that the input directory still exists.
    pub health_check_interval_ms: u64,
    /// Sweep cadence (ms) when filesystem events are unavailable.
    pub poll_interval_ms: u64,
    /// Stability checks run in parallel per batch.
    pub gate_concurrency: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: ScannerMode::Batch,
            interval_ms: 1_000,
            idle_sleep_ms: 100,
            health_check_interval_ms: 2_000,
            poll_interval_ms: 5_000,
            gate_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    /// Replace a worker after this many jobs. Unset keeps workers for the
    /// lifetime of the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tasks_per_worker: Option<usize>,
    pub dispatch: DispatchMode,
    pub chunk_threshold: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: num_cpus::get(),
            max_tasks_per_worker: None,
            dispatch: DispatchMode::PerFile,
            chunk_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    Dbscan,
    Grid,
}

/// Clustering parameters for the reference engine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub algorithm: AlgorithmKind,
    /// Neighbourhood radius for `dbscan`, cell size for `grid`.
    pub eps: f64,
    pub min_samples: usize,
    pub output_format: OutputFormat,
    /// Name of the column added to clustered outputs.
    pub attribute: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::Dbscan,
            eps: 4.0,
            min_samples: 3,
            output_format: OutputFormat::Full,
            attribute: klarfd_core::cluster::DEFAULT_ATTRIBUTE.to_string(),
        }
    }
}

impl AnalysisConfig {
    pub fn algorithm(&self) -> Algorithm {
        match self.algorithm {
            AlgorithmKind::Dbscan => Algorithm::Dbscan {
                eps: self.eps,
                min_samples: self.min_samples,
            },
            AlgorithmKind::Grid => Algorithm::Grid {
                cell: self.eps,
                min_samples: self.min_samples,
            },
        }
    }
}

/// Alert recipient. Alerts are only logged until both `host` and `receiver`
/// are set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MailingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

impl Default for MailingConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 25,
            sender: None,
            receiver: None,
        }
    }
}

impl MailingConfig {
    pub fn is_enabled(&self) -> bool {
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        set(&self.host) && set(&self.receiver)
    }

    /// Transport settings, or `None` when alerts should only be logged.
    pub fn settings(&self) -> Option<MailSettings> {
        if !self.is_enabled() {
            return None;
        }
        let receiver = self.receiver.clone().unwrap_or_default();
        Some(MailSettings {
            host: self.host.clone().unwrap_or_default(),
            port: self.port,
            sender: self.sender.clone().unwrap_or_else(|| receiver.clone()),
            receiver,
        })
    }
}
