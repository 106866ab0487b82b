use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use klarfd_config::{AlgorithmKind, ConfigLoader, ConfigOverrides, ConfigSource, EnvConfig};
use klarfd_core::{Algorithm, DispatchMode, OutputFormat, ScannerMode};

const TOML: &str = r#"
[directories]
input = "/srv/klarf/in"
output = "/srv/klarf/out/{loader_name}"
error = "/srv/klarf/error"
logs = "/srv/klarf/logs"

[stability]
timeout_secs = 20
sample_interval_ms = 500

[scanner]
mode = "watch"
poll_interval_ms = 2500

[workers]
count = 3
max_tasks_per_worker = 50
dispatch = "chunked"
chunk_threshold = 6

[analysis]
algorithm = "grid"
eps = 2.5
min_samples = 4
output_format = "baby"

[mailing]
host = "smtp.fab.local"
receiver = "yield@fab.local"

[platforms.windows.directories]
input = 'D:\klarf\in'
error = 'D:\klarf\error'
"#;

fn no_env() -> EnvConfig {
    EnvConfig::default()
}

#[test]
fn missing_everything_yields_defaults() {
    let root = tempfile::tempdir().unwrap();
    let load = ConfigLoader::new()
        .with_search_root(root.path())
        .load_with_env(&no_env())
        .unwrap();

    assert_eq!(load.source, ConfigSource::Default);
    assert_eq!(load.config.directories.input, PathBuf::from("/data/clustering/tmp"));
    assert_eq!(load.config.stability.timeout_secs, 10);
    assert_eq!(load.config.analysis.attribute, "CLUSTER_ID");
    assert!(load.config.workers.count >= 1);
    assert!(!load.warnings.is_empty());
}

#[test]
fn toml_file_is_fully_mapped_into_pipeline_settings() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("site.toml");
    fs::write(&path, TOML).unwrap();

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_platform("linux")
        .load_with_env(&no_env())
        .unwrap();
    assert_eq!(load.source, ConfigSource::Explicit(path));
    assert!(!load.platform_applied);
    assert!(load.warnings.is_empty(), "{:?}", load.warnings);

    let config = &load.config;
    assert_eq!(config.analysis.algorithm, AlgorithmKind::Grid);
    assert_eq!(config.mailing.port, 25);
    assert_eq!(config.mailing.settings().unwrap().sender, "yield@fab.local");

    let settings = config.to_pipeline_settings();
    assert_eq!(settings.input_dir(), PathBuf::from("/srv/klarf/in"));
    assert_eq!(settings.output.as_str(), "/srv/klarf/out/{loader_name}");
    assert_eq!(settings.stability.timeout, Duration::from_secs(20));
    assert_eq!(settings.stability.sample_interval, Duration::from_millis(500));
    assert_eq!(settings.mode, ScannerMode::Watch);
    assert_eq!(settings.scan.poll_interval, Duration::from_millis(2500));
    assert_eq!(settings.scan.interval, Duration::from_secs(1));
    assert_eq!(settings.scan.dispatch, DispatchMode::Chunked);
    assert_eq!(settings.scan.workers, 3);
    assert_eq!(settings.pool.workers, 3);
    assert_eq!(settings.pool.max_tasks_per_worker, Some(50));
    assert_eq!(settings.format, OutputFormat::Baby);
    assert_eq!(
        settings.algorithm,
        Algorithm::Grid {
            cell: 2.5,
            min_samples: 4
        }
    );
}

#[test]
fn platform_overrides_replace_only_listed_directories() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("site.toml");
    fs::write(&path, TOML).unwrap();

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_platform("windows")
        .load_with_env(&no_env())
        .unwrap();

    assert!(load.platform_applied);
    let dirs = &load.config.directories;
    assert_eq!(dirs.input, PathBuf::from(r"D:\klarf\in"));
    assert_eq!(dirs.error, PathBuf::from(r"D:\klarf\error"));
    assert_eq!(dirs.logs, PathBuf::from("/srv/klarf/logs"));
}

#[test]
fn command_line_wins_over_environment_and_environment_over_files() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("config")).unwrap();
    fs::write(
        root.path().join("config/klarfd.toml"),
        "[workers]\ncount = 2\n",
    )
    .unwrap();
    let env_file = root.path().join("env.json");
    fs::write(&env_file, r#"{"workers": {"count": 5}}"#).unwrap();
    let explicit = root.path().join("explicit.toml");
    fs::write(&explicit, "[workers]\ncount = 7\n").unwrap();

    let loader = ConfigLoader::new().with_search_root(root.path());

    let load = loader.load_with_env(&no_env()).unwrap();
    assert_eq!(load.source, ConfigSource::File(root.path().join("config/klarfd.toml")));
    assert_eq!(load.config.workers.count, 2);

    let inline = EnvConfig {
        config_path: None,
        config_json: Some(r#"{"workers": {"count": 4}}"#.into()),
    };
    let load = loader.load_with_env(&inline).unwrap();
    assert_eq!(load.source, ConfigSource::EnvInline);
    assert_eq!(load.config.workers.count, 4);

    let both = EnvConfig {
        config_path: Some(env_file.clone()),
        ..inline
    };
    let load = loader.load_with_env(&both).unwrap();
    assert_eq!(load.source, ConfigSource::EnvPath(env_file));
    assert_eq!(load.config.workers.count, 5);

    let load = loader
        .clone()
        .with_config_path(&explicit)
        .load_with_env(&both)
        .unwrap();
    assert_eq!(load.config.workers.count, 7);
}

#[test]
fn guard_rail_failures_abort_loading() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("bad.toml");
    fs::write(&path, "[workers]\ncount = 0\n").unwrap();

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(&no_env())
        .unwrap_err();
    assert!(format!("{err:#}").contains("workers.count"));
}

#[test]
fn explicit_path_that_does_not_exist_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let err = ConfigLoader::new()
        .with_config_path(root.path().join("missing.toml"))
        .load_with_env(&no_env())
        .unwrap_err();
    assert!(err.to_string().contains("failed to read configuration"));
}

#[test]
fn command_line_overrides_apply_before_the_guard_rails() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("zero.toml");
    fs::write(&path, "[workers]\ncount = 0\n\n[scanner]\nmode = \"batch\"\n").unwrap();

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_overrides(ConfigOverrides {
            mode: Some(ScannerMode::Watch),
            workers: Some(4),
        })
        .load_with_env(&no_env())
        .unwrap();

    assert_eq!(load.config.workers.count, 4);
    assert_eq!(load.config.scanner.mode, ScannerMode::Watch);
    assert_eq!(load.config.to_pipeline_settings().pool.workers, 4);

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_overrides(ConfigOverrides {
            mode: None,
            workers: Some(0),
        })
        .load_with_env(&no_env())
        .unwrap_err();
    assert!(format!("{err:#}").contains("workers.count"));
}
