use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dash_lab_abstract::RunParameters;
use dash_lab_simulator::{RunReport, run_experiment};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one adaptive streaming experiment over a simulated link")]
struct Args {
    /// Load run parameters from a TOML file. Flags given here override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run id, used for the artifact directory and client logs.
    #[arg(long)]
    simulation_id: Option<u32>,

    /// Adaptation algorithm: festive, panda or tobasco.
    #[arg(long)]
    adaptation_algo: Option<String>,

    /// Transport protocol, TCP or QUIC (case-insensitive).
    #[arg(long)]
    transport_protocol: Option<String>,

    /// Link rate, e.g. 5Mbps.
    #[arg(long)]
    data_rate: Option<String>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pacing_enabled: Option<bool>,

    /// Packet error rate on the client's receive path, in [0, 1].
    #[arg(long)]
    error_rate: Option<f64>,

    #[arg(long)]
    segment_size_file: Option<PathBuf>,

    /// Root of the per-run artifact directories.
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Stop the timeline after this many simulated seconds.
    #[arg(long)]
    stop_time: Option<f64>,

    /// Write a JSON report of the finished run.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!("dash-streaming starting...");

    let params = args.parameters()?;
    let report = run_experiment(&params).context("Experiment setup failed")?;
    log_summary(&report);

    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
    }
    Ok(())
}

impl Args {
    /// Built-in defaults, then the config file, then flags.
    fn parameters(&self) -> Result<RunParameters> {
        let mut params = match &self.config {
            Some(path) => load_parameters(path)?,
            None => RunParameters::default(),
        };
        if let Some(id) = self.simulation_id {
            params.simulation_id = id;
        }
        if let Some(algo) = &self.adaptation_algo {
            params.adaptation_algo = algo.clone();
        }
        if let Some(protocol) = &self.transport_protocol {
            params.transport_protocol = protocol.clone();
        }
        if let Some(rate) = &self.data_rate {
            params.data_rate = rate.clone();
        }
        if let Some(pacing) = self.pacing_enabled {
            params.pacing_enabled = pacing;
        }
        if let Some(rate) = self.error_rate {
            params.error_rate = rate;
        }
        if let Some(path) = &self.segment_size_file {
            params.segment_size_file = path.clone();
        }
        if let Some(dir) = &self.logs_dir {
            params.logs_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        if self.stop_time.is_some() {
            params.stop_time = self.stop_time;
        }
        Ok(params)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_parameters(path: &Path) -> Result<RunParameters> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read run parameters {}", path.display()))?;
    let params: RunParameters =
        toml::from_str(&content).context("Failed to parse run parameters")?;
    Ok(params)
}

fn log_summary(report: &RunReport) {
    let sim = &report.simulation;
    let segments = sim.metric_series("segment_bitrate").map_or(0, |s| s.len());
    let stalls = sim.metric_series("stall").map_or(0, |s| s.len());
    info!(
        "Simulated {} | events: {} | segments: {} | stalls: {} | artifacts in {}",
        sim.duration,
        sim.events_processed,
        segments,
        stalls,
        report.artifact_dir.display()
    );
}

fn write_trace(path: &Path, report: &RunReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize run report")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
