use std::path::PathBuf;

use klarfd_core::OutputTemplate;
use serde::{Deserialize, Serialize};

/// Where reports come from and where they end up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoriesConfig {
    /// Hot folder watched for new reports.
    pub input: PathBuf,
    /// Output location; may contain placeholders such as `{loader_name}`.
    pub output: OutputTemplate,
    /// Failed reports are moved here.
    pub error: PathBuf,
    pub logs: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp: Option<PathBuf>,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("/data/clustering/tmp"),
            output: OutputTemplate::new("/data/clustering/output/{loader_name}"),
            error: PathBuf::from("/data/clustering/error"),
            logs: PathBuf::from("/data/clustering/logs"),
            archive: None,
            tmp: None,
        }
    }
}

impl DirectoriesConfig {
    pub fn apply(&mut self, overrides: DirectoryOverrides) {
        let DirectoryOverrides {
            input,
            output,
            error,
            logs,
            archive,
            tmp,
        } = overrides;
        if let Some(input) = input {
            self.input = input;
        }
        if let Some(output) = output {
            self.output = output;
        }
        if let Some(error) = error {
            self.error = error;
        }
        if let Some(logs) = logs {
            self.logs = logs;
        }
        if archive.is_some() {
            self.archive = archive;
        }
        if tmp.is_some() {
            self.tmp = tmp;
        }
    }
}

/// Per-platform replacement values; unset fields keep the base value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub directories: DirectoryOverrides,
}
