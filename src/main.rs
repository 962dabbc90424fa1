//! s2i-verify - build-and-verify harness for S2I builder images
//!
//! Runs with no flags; the image under test comes from `IMAGE_NAME`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use s2i_verify::builder::S2iCli;
use s2i_verify::config::{Overrides, VerifyConfig};
use s2i_verify::error::{VerifyError, EXIT_PRECONDITION};
use s2i_verify::logging::init_logging;
use s2i_verify::orchestrator::Orchestrator;
use s2i_verify::probe::ReqwestProbe;
use s2i_verify::runtime::CliRuntime;

/// Build an S2I builder image's test application and verify the result
#[derive(Parser)]
#[command(name = "s2i-verify")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-and-verify harness for source-to-image builder images", long_about = None)]
struct Cli {
    /// Builder image under test
    #[arg(long, env = "IMAGE_NAME")]
    image_name: Option<String>,

    /// Runtime-only image for the runtime build
    #[arg(long, env = "RUNTIME_IMAGE_NAME")]
    runtime_image: Option<String>,

    /// Test application source directory
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Extra configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Leave built images in place
    #[arg(long)]
    keep_images: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        image_name: cli.image_name,
        runtime_image: cli.runtime_image,
        source_dir: cli.source_dir,
        log_level: cli.log_level,
        keep_images: cli.keep_images,
    };

    // Load configuration; logging is not up yet, so report on stderr
    let config = match VerifyConfig::load(cli.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            let err = VerifyError::invalid_config(e);
            eprintln!("Error: {}", err);
            std::process::exit(err.exit_code());
        }
    };

    // Initialize logging
    init_logging(&config.log_level, config.log_dir.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        image = %config.image_name,
        "Starting s2i-verify"
    );

    // Missing tools are precondition failures; nothing exists yet to clean up
    let runtime = match CliRuntime::new(config.runtime_path.as_deref()).await {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "Container runtime unavailable");
            std::process::exit(EXIT_PRECONDITION);
        }
    };

    let builder = match S2iCli::new(config.builder_path.as_deref()) {
        Ok(builder) => Arc::new(builder),
        Err(e) => {
            error!(error = %e, "Build tool unavailable");
            std::process::exit(EXIT_PRECONDITION);
        }
    };

    let probe = Arc::new(ReqwestProbe::new()?);
    let report_path = cli.report;

    let orchestrator = Orchestrator::new(config, builder, runtime, probe)?;
    let report = orchestrator.run_with_shutdown(shutdown_signal()).await;

    if let Some(path) = report_path {
        if let Err(e) = report.write_json(&path) {
            warn!(error = %e, "Failed to write report");
        }
    }

    info!(
        state = %report.state,
        exit_code = report.exit_code,
        "s2i-verify finished"
    );

    if !report.success() {
        std::process::exit(report.exit_code);
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown requested, cleaning up");
}
