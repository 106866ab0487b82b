use std::fmt;

use klarfd_core::{DispatchMode, ScannerMode};
use thiserror::Error;

use crate::models::PipelineConfig;

/// Settings the pipeline cannot run with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("workers.count must be at least 1")]
    NoWorkers,
    #[error("directories.input must not be empty")]
    EmptyInput,
    #[error("stability.timeout_secs must be at least 1")]
    ZeroStabilityTimeout,
    #[error("directories.input and directories.error must differ ({0})")]
    ErrorInsideInput(String),
    #[error("analysis.{field} {reason}")]
    InvalidAnalysis { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({hint})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Reject unusable settings and collect the questionable ones.
pub fn apply_guard_rails(config: &PipelineConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let dirs = &config.directories;

    if config.workers.count == 0 {
        return Err(ConfigGuardRailError::NoWorkers);
    }
    if dirs.input.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::EmptyInput);
    }
    if config.stability.timeout_secs == 0 {
        return Err(ConfigGuardRailError::ZeroStabilityTimeout);
    }
    if dirs.input == dirs.error {
        return Err(ConfigGuardRailError::ErrorInsideInput(
            dirs.input.display().to_string(),
        ));
    }
    if !(config.analysis.eps.is_finite() && config.analysis.eps > 0.0) {
        return Err(ConfigGuardRailError::InvalidAnalysis {
            field: "eps",
            reason: format!("must be a positive number, got {}", config.analysis.eps),
        });
    }
    if config.analysis.min_samples == 0 {
        return Err(ConfigGuardRailError::InvalidAnalysis {
            field: "min_samples",
            reason: "must be at least 1".into(),
        });
    }

    if !config.mailing.is_enabled() {
        warnings.push_with_hint(
            "mailing.host or mailing.receiver not set; failure alerts are only logged",
            "Set both under [mailing] to send alerts by mail",
        );
    }

    if dirs.error.starts_with(&dirs.input) || dirs.output.static_prefix().starts_with(&dirs.input)
    {
        warnings.push(
            "error or output directory lies inside the input directory; scans only look at the top level",
        );
    }

    if !dirs.output.is_templated() {
        warnings.push("directories.output has no placeholder; every report is written to one directory");
    }

    let stability = config.stability.policy();
    if stability.sample_interval >= stability.timeout {
        warnings.push_with_hint(
            "stability.sample_interval_ms is not shorter than the timeout; a single size sample decides",
            "Use an interval well below stability.timeout_secs",
        );
    }

    if config.workers.max_tasks_per_worker == Some(0) {
        warnings.push("workers.max_tasks_per_worker = 0 disables worker recycling");
    }

    if config.workers.dispatch == DispatchMode::Chunked && config.workers.count == 1 {
        warnings.push("chunked dispatch with a single worker behaves like per-file dispatch");
    }

    if config.scanner.gate_concurrency == 0 {
        warnings.push("scanner.gate_concurrency = 0 is treated as 1");
    }

    if config.scanner.mode == ScannerMode::Watch && config.scanner.health_check_interval_ms == 0 {
        warnings.push("scanner.health_check_interval_ms = 0; directory checks run continuously");
    }

    Ok(warnings)
}
