//! Configuration for the klarfd daemon.
//!
//! Loads a [`PipelineConfig`] from the command line, the environment or a
//! default file location, applies per-platform directory overrides and
//! command-line overrides, runs the guard rails and converts the result into
//! [`klarfd_core::PipelineSettings`].

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{
    ConfigLoad, ConfigLoader, ConfigLoaderOptions, ConfigOverrides, ConfigSource, EnvConfig,
};
pub use models::{
    AlgorithmKind, AnalysisConfig, DirectoriesConfig, DirectoryOverrides, MailingConfig,
    PipelineConfig, PlatformConfig, ScannerConfig, StabilityConfig, WorkersConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
