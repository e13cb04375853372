use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use loadcache_service::config::Config;
use loadcache_service::{logging, metrics};

mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Runs synthetic load workloads against an engine and reports how well requests were
/// deduplicated and served from the caches.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Engine configuration (YAML). Defaults apply without it.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Workload definitions (YAML).
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// How long to keep the workloads running, like `30s` or `2m`.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let workloads = WorkloadsConfig::load(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref())?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config.logging);
    metrics::configure_statsd(&config.metrics).context("failed to configure statsd")?;

    let result = perform_stresstest(config, workloads, cli.duration).await;
    if let Err(error) = &result {
        logging::ensure_log_error(error);
    }
    result
}
