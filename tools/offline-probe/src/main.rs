//! Probe harness for the TvKit offline cache worker.
//!
//! Runs the real worker host against a live origin and prints a JSON report
//! of the cache generations and how each request was served.
//!
//! ## Usage
//!
//! ```bash
//! # Install (or upgrade) the worker and show what got seeded
//! offline-probe install --origin https://tv.example/ --persist .cache/tvkit
//!
//! # Request paths through the worker
//! offline-probe fetch --origin https://tv.example/ --persist .cache/tvkit / /guide /api/epg
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tvkit_common::{init_logging, LogConfig, LogFormat};
use tvkit_net::{LoaderConfig, Request, ResourceLoader, Url};
use tvkit_sw::{
    CacheStorage, RegistrationOutcome, ServiceWorkerContainer, StorageConfig, WorkerConfig,
};

mod report;

use report::{ActivationSummary, ProbeReport, RequestReport};

#[derive(Parser)]
#[command(name = "offline-probe")]
#[command(about = "Probe harness for the TvKit offline cache worker")]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Origin the worker is registered for
    #[arg(long)]
    origin: Url,

    /// Worker script path, relative to the origin
    #[arg(long, default_value = "sw.js")]
    script: String,

    /// Worker config JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory mirroring cache generations between runs
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Cache quota in bytes
    #[arg(long)]
    quota: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the worker and report the seeded cache
    Install {
        #[command(flatten)]
        target: Target,
    },

    /// Register the worker, then request paths through it
    Fetch {
        #[command(flatten)]
        target: Target,

        /// Root-relative paths to request
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(format))?;

    let report = match cli.command {
        Commands::Install { target } => probe(&target, &[]).await?,
        Commands::Fetch { target, paths } => probe(&target, &paths).await?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    // Leaked generations are retried on the next activation
    if let Some(ref activation) = report.activation {
        if !activation.leaked.is_empty() {
            warn!(leaked = ?activation.leaked, "Stale generations could not be deleted");
            std::process::exit(2);
        }
    }
    Ok(())
}

async fn probe(target: &Target, paths: &[String]) -> anyhow::Result<ProbeReport> {
    let worker_config = match target.config {
        Some(ref path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    let version = worker_config.cache_version.clone();

    let storage = CacheStorage::from_config(&StorageConfig {
        persist_dir: target.persist.clone(),
        quota_bytes: target.quota,
    })
    .await?;
    let loader = ResourceLoader::new(LoaderConfig {
        default_timeout: worker_config.network_timeout(),
        ..Default::default()
    })?;
    let container = ServiceWorkerContainer::new(Arc::new(loader), storage);

    let script = target
        .origin
        .join(&target.script)
        .with_context(|| format!("bad script path '{}'", target.script))?;
    info!(script = %script, version = %version, "Registering worker");

    let (installed, activation) = match container.register(script, worker_config).await? {
        RegistrationOutcome::Unchanged { .. } => (false, None),
        RegistrationOutcome::Installed { activation, .. } => (true, activation),
    };

    let mut requests = Vec::with_capacity(paths.len());
    if !paths.is_empty() {
        let page = container.connect(target.origin.clone()).await;
        for path in paths {
            let url = target
                .origin
                .join(path)
                .with_context(|| format!("bad request path '{path}'"))?;
            let result = container
                .handle_fetch(Some(page.client_id), Request::get(url))
                .await;
            requests.push(RequestReport::new(path, &result));
        }
        container.wait_for_cache_writes().await;
    }

    let generations = report::generations(&*container.caches().read().await);

    Ok(ProbeReport {
        origin: target.origin.to_string(),
        version,
        installed,
        activation: activation.as_ref().map(ActivationSummary::from),
        generations,
        requests,
    })
}
