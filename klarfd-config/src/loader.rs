use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use klarfd_core::ScannerMode;
use tracing::debug;

use crate::models::PipelineConfig;
use crate::validation::{ConfigWarnings, apply_guard_rails};

pub const CONFIG_PATH_VAR: &str = "KLARFD_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "KLARFD_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "klarfd.toml",
    "klarfd.json",
    "config/klarfd.toml",
    "config/klarfd.json",
];

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// `--config` on the command line.
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("built-in defaults"),
            ConfigSource::Explicit(path) => write!(f, "{} (--config)", path.display()),
            ConfigSource::EnvPath(path) => write!(f, "{} (${CONFIG_PATH_VAR})", path.display()),
            ConfigSource::EnvInline => write!(f, "${CONFIG_JSON_VAR}"),
            ConfigSource::File(path) => f.write_str(&path.display().to_string()),
        }
    }
}

/// Environment-derived inputs to the loader.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: std::env::var(CONFIG_PATH_VAR)
                .ok()
                .filter(|raw| !raw.trim().is_empty())
                .map(PathBuf::from),
            config_json: std::env::var(CONFIG_JSON_VAR)
                .ok()
                .filter(|raw| !raw.trim().is_empty()),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    /// Directory the default candidate files are looked up in. Defaults to
    /// the working directory.
    pub search_root: Option<PathBuf>,
    /// Operating system whose `platforms` entry applies. Defaults to the
    /// one this binary was built for.
    pub platform: Option<String>,
    pub overrides: ConfigOverrides,
}

/// Values given on the command line. They replace the loaded ones before
/// the guard rails run, so `--workers 4` rescues a file with `count = 0`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub mode: Option<ScannerMode>,
    pub workers: Option<usize>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(mode) = self.mode {
            config.scanner.mode = mode;
        }
        if let Some(workers) = self.workers {
            config.workers.count = workers;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: PipelineConfig,
    pub source: ConfigSource,
    /// Whether a `platforms.<os>` entry was applied.
    pub platform_applied: bool,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_search_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.options.search_root = Some(root.into());
        self
    }

    pub fn with_platform<S: Into<String>>(mut self, platform: S) -> Self {
        self.options.platform = Some(platform.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.options.overrides = overrides;
        self
    }

    /// Load from the process environment.
    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        self.load_with_env(&EnvConfig::gather())
    }

    /// Evaluation order:
    /// 1) `--config`,
    /// 2) `$KLARFD_CONFIG_PATH` (TOML or JSON file),
    /// 3) `$KLARFD_CONFIG_JSON` (inline JSON),
    /// 4) the first default candidate file that exists,
    /// 5) built-in defaults.
    ///
    /// Platform directories and then command-line overrides are applied
    /// before the guard rails check the result.
    pub fn load_with_env(&self, env: &EnvConfig) -> anyhow::Result<ConfigLoad> {
        let (mut config, source) = self.resolve(env)?;

        let platform = self
            .options
            .platform
            .clone()
            .unwrap_or_else(|| std::env::consts::OS.to_string());
        let platform_applied = config.apply_platform(&platform);
        self.options.overrides.apply(&mut config);
        debug!(%source, %platform, platform_applied, "configuration resolved");

        let warnings = apply_guard_rails(&config)
            .with_context(|| format!("invalid configuration from {source}"))?;

        Ok(ConfigLoad {
            config,
            source,
            platform_applied,
            warnings,
        })
    }

    fn resolve(&self, env: &EnvConfig) -> anyhow::Result<(PipelineConfig, ConfigSource)> {
        if let Some(path) = &self.options.config_path {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(path) = &env.config_path {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let config =
                parse_json(raw).with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((PipelineConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let root = self.options.search_root.as_deref().unwrap_or(Path::new(""));
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.is_file())
    }
}

pub fn load_from_file(path: &Path) -> anyhow::Result<PipelineConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            parse_json(&contents).with_context(|| format!("invalid configuration {}", path.display()))
        }
        Some("toml") | Some("tml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid configuration {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<PipelineConfig> {
    // TOML first, then JSON.
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse configuration {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<PipelineConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid configuration json: {err}"))
}
