use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dash_lab_abstract::SweepPlan;
use dash_lab_simulator::sweep::load_plan;
use dash_lab_simulator::{SweepSummary, run_sweep};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a grid of streaming experiments into a results tree")]
struct Args {
    /// Directory receiving one sub-tree per run.
    output_dir: PathBuf,

    /// TOML sweep plan. Missing fields fall back to the standard grid.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("dash-lab-sweep starting...");

    let plan = match &args.plan {
        Some(path) => load_plan(path)?,
        None => SweepPlan::default(),
    };
    let summary = run_sweep(&args.output_dir, &plan)?;
    log_summary(&summary);
    Ok(())
}

fn log_summary(summary: &SweepSummary) {
    info!(
        "Runs: {} | succeeded: {} | failed: {}",
        summary.runs,
        summary.succeeded(),
        summary.failures.len()
    );
    for failure in &summary.failures {
        warn!("{}: {}", failure.description, failure.error);
    }
}
