//! # klarfd
//!
//! Watches a hot folder for KLARF inspection reports, clusters the defects of
//! each report and writes the clustered copy into the output directory.
//! Reports that cannot be processed are moved to the error directory and an
//! alert is sent to the configured recipient.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use klarfd_config::{ConfigLoad, ConfigLoader, ConfigOverrides, PipelineConfig};
use klarfd_core::cluster::ClusteringEngine;
use klarfd_core::klarf::KlarfParser;
use klarfd_core::notify::{LogOnlyTransport, SmtpTransport};
use klarfd_core::{
    AlertTransport, Collaborators, FailureNotifier, MailSettings, Pipeline, RealFs, ScannerMode,
};
use tracing::{error, info, warn};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "klarfd", version)]
#[command(about = "Hot-folder daemon that clusters KLARF inspection reports")]
struct Cli {
    /// Configuration file (TOML or JSON). Overrides $KLARFD_CONFIG_PATH.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scanner strategy (overrides config)
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Number of workers (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Load and validate the configuration, print it and exit
    #[arg(long, default_value_t = false)]
    check_config: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Batch,
    Watch,
}

impl From<ModeArg> for ScannerMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Batch => ScannerMode::Batch,
            ModeArg::Watch => ScannerMode::Watch,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new().with_overrides(ConfigOverrides {
        mode: cli.mode.map(ScannerMode::from),
        workers: cli.workers,
    });
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad {
        config,
        source,
        platform_applied,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if cli.check_config {
        let rendered =
            toml_summary(&config).context("failed to render the effective configuration")?;
        println!("# source: {source}");
        println!("{rendered}");
        for warning in warnings.iter() {
            eprintln!("warning: {warning}");
        }
        return Ok(());
    }

    // The pipeline prepares the remaining directories when it starts.
    let _log_guard =
        logging::init(&config.directories.logs).context("failed to initialize logging")?;

    info!(%source, platform_applied, "configuration loaded");
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    run(config).await
}

async fn run(config: PipelineConfig) -> anyhow::Result<()> {
    let (transport, recipient) = match config.mailing.settings() {
        Some(settings) => {
            info!(
                host = %settings.host,
                port = settings.port,
                receiver = %settings.receiver,
                "failure alerts are sent by mail"
            );
            let transport: Arc<dyn AlertTransport> = Arc::new(SmtpTransport::new(SMTP_TIMEOUT));
            (transport, settings)
        }
        None => {
            let transport: Arc<dyn AlertTransport> = Arc::new(LogOnlyTransport);
            (transport, MailSettings::default())
        }
    };

    let collaborators = Collaborators {
        fs: Arc::new(RealFs::new()),
        parser: Arc::new(KlarfParser::new()),
        engine: Arc::new(ClusteringEngine::new(config.analysis.attribute.clone())),
        notifier: FailureNotifier::new(transport, recipient),
    };

    let handle = Pipeline::new(config.to_pipeline_settings(), collaborators)
        .start()
        .await
        .context("failed to start pipeline")?;

    shutdown_signal().await;
    info!("shutdown requested; finishing submitted reports");
    let stats = handle.shutdown(true).await;
    info!(%stats, "klarfd stopped");
    Ok(())
}

fn toml_summary(config: &PipelineConfig) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_parse() {
        let cli = Cli::parse_from([
            "klarfd",
            "--config",
            "/etc/klarfd.toml",
            "--mode",
            "watch",
            "-w",
            "4",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/klarfd.toml")));
        assert_eq!(cli.mode.map(ScannerMode::from), Some(ScannerMode::Watch));
        assert_eq!(cli.workers, Some(4));
        assert!(!cli.check_config);
    }
}
