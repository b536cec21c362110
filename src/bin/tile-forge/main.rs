//! Binary entry point. Grounded on the teacher's `main.rs`: parse args, build
//! an `env_logger` from verbosity flags, load config, drive one run, map the
//! result to a process exit code.

mod args;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use args::Args;
use tile_forge::config::load_config;
use tile_forge::error::TileForgeError;
use tile_forge::geometry::coverage_set;
use tile_forge::orchestrator;
use tile_forge::pipeline::CancelToken;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_ALL_FAILED: u8 = 2;
const EXIT_CANCELLED: u8 = 3;

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let config = load_config(&args.config).with_context(|| format!("loading config from {}", args.config.display()))?;

    let (region_name, region_spec) = orchestrator::resolve_region(&config, args.region.as_deref(), args.bbox_array(), args.min_zoom, args.max_zoom)
        .context("resolving region selection")?;

    let sources = orchestrator::build_sources(&config, &args.servers, &args.sources)
        .await
        .context("building configured sources")?;

    if sources.is_empty() {
        warn!("no sources selected; nothing to do");
        return Ok(EXIT_OK);
    }

    if args.dry_run {
        let coverage = coverage_set(&region_spec.bbox(), region_spec.min_zoom, region_spec.max_zoom);
        info!("region {region_name}: {} tiles in coverage across {}..={}", coverage.len(), region_spec.min_zoom, region_spec.max_zoom);
        for configured in &sources {
            let accepted = coverage.iter().filter(|&&coord| configured.adapter.accepts(coord)).count();
            info!("  source {:?} ({}): {accepted} candidate tiles", configured.spec.name, configured.spec.tile_kind);
        }
        return Ok(EXIT_OK);
    }

    let cancel = CancelToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, cancelling...");
            cancel_for_signal.cancel();
        }
    });

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} tiles ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let outcome = orchestrator::run_region(&config, &region_name, &region_spec, sources, cancel, Some(progress)).await;

    match outcome {
        Ok(run) => {
            let report = &run.report;
            info!(
                "region {}: {} stored, {} failed, {} skipped (uncoverable)",
                run.region_name, report.counts.stored, report.counts.failed, report.uncoverable
            );
            for (name, summary) in &report.per_source {
                info!(
                    "  {name}: stored={} failed_here={} not_found={} empty={} invalid={} transient={}",
                    summary.stored, summary.failed, summary.not_found, summary.empty, summary.invalid, summary.transient_errors
                );
            }

            if report.all_failed() {
                error!("every tile failed across all sources for region {}", run.region_name);
                Ok(EXIT_ALL_FAILED)
            } else {
                Ok(EXIT_OK)
            }
        }
        Err(TileForgeError::Cancelled) => {
            warn!("run cancelled");
            Ok(EXIT_CANCELLED)
        }
        Err(e) => Err(e.into()),
    }
}
