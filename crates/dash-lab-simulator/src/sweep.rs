use anyhow::{Context, Result};
use dash_lab_abstract::{RunParameters, SweepPlan};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::experiment::run_experiment;

/// A run of the sweep that ended in a setup error.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub simulation_id: u32,
    pub description: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub runs: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepSummary {
    pub fn succeeded(&self) -> usize {
        self.runs - self.failures.len()
    }
}

pub fn load_plan(path: &Path) -> Result<SweepPlan> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read sweep plan {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid sweep plan {}", path.display()))
}

fn pacing_label(pacing: bool) -> &'static str {
    if pacing { "pacing" } else { "no-pacing" }
}

fn loss_label(error_rate: f64) -> String {
    format!("loss-{error_rate}")
}

/// `<base>/<protocol>/<algorithm>/<rate>/<pacing|no-pacing>/loss-<rate>`
pub fn run_output_dir(base: &Path, params: &RunParameters) -> PathBuf {
    base.join(&params.transport_protocol)
        .join(&params.adaptation_algo)
        .join(&params.data_rate)
        .join(pacing_label(params.pacing_enabled))
        .join(loss_label(params.error_rate))
}

pub fn run_output_file(params: &RunParameters) -> String {
    format!(
        "output_{}_{}_{}_{}_{}.log",
        params.transport_protocol,
        params.adaptation_algo,
        params.data_rate,
        pacing_label(params.pacing_enabled),
        loss_label(params.error_rate)
    )
}

fn is_path_component(value: &str) -> bool {
    !(value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\', '\0']))
}

/// The first run parameter that would not stay a single directory level.
fn unsafe_component(params: &RunParameters) -> Option<&str> {
    [
        &params.transport_protocol,
        &params.adaptation_algo,
        &params.data_rate,
    ]
    .into_iter()
    .map(String::as_str)
    .find(|value| !is_path_component(value))
}

pub fn describe(params: &RunParameters) -> String {
    let mut text = format!(
        "Simulation {}: {} over {} @ {} - {}",
        params.simulation_id,
        params.adaptation_algo,
        params.transport_protocol,
        params.data_rate,
        if params.pacing_enabled { "pacing" } else { "no pacing" },
    );
    if params.error_rate > 0.0 {
        text.push_str(&format!(" - loss {}", params.error_rate));
    }
    text
}

/// Execute every run of `plan` in order, collecting each run's report and
/// client logs under `output_dir`. A run that fails setup is recorded and the
/// sweep moves on; filesystem errors in the output tree abort the sweep.
pub fn run_sweep(output_dir: &Path, plan: &SweepPlan) -> Result<SweepSummary> {
    let runs = plan.runs();
    info!("Sweep of {} runs into {}", runs.len(), output_dir.display());
    let mut summary = SweepSummary::default();
    for params in &runs {
        summary.runs += 1;
        if let Some(failure) = run_one(output_dir, params)? {
            summary.failures.push(failure);
        }
    }
    info!(
        "Sweep finished: {} of {} runs succeeded",
        summary.succeeded(),
        summary.runs
    );
    Ok(summary)
}

fn run_one(output_dir: &Path, params: &RunParameters) -> Result<Option<SweepFailure>> {
    let description = describe(params);
    info!("{}", description);
    if let Some(bad) = unsafe_component(params) {
        let error = format!("'{bad}' cannot be used as an output directory name");
        warn!("{} skipped: {}", description, error);
        return Ok(Some(SweepFailure {
            simulation_id: params.simulation_id,
            description,
            error,
        }));
    }
    let out = run_output_dir(output_dir, params);
    fs::create_dir_all(&out).with_context(|| format!("failed to create {}", out.display()))?;
    let log_path = out.join(run_output_file(params));

    info!("Running...");
    let failure = match run_experiment(params) {
        Ok(report) => {
            let json = serde_json::to_string_pretty(&report)?;
            fs::write(&log_path, json)
                .with_context(|| format!("failed to write {}", log_path.display()))?;
            None
        }
        Err(err) => {
            let err = anyhow::Error::new(err);
            warn!("{} failed: {:#}", description, err);
            fs::write(&log_path, format!("{err:#}\n"))
                .with_context(|| format!("failed to write {}", log_path.display()))?;
            Some(SweepFailure {
                simulation_id: params.simulation_id,
                description,
                error: format!("{err:#}"),
            })
        }
    };

    let artifacts = params
        .logs_dir
        .join(&params.adaptation_algo)
        .join(params.simulation_id.to_string());
    if artifacts.is_dir() {
        copy_files(&artifacts, &out)?;
    }
    info!("Done simulation");
    Ok(failure)
}

fn copy_files(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from).with_context(|| format!("failed to list {}", from.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            let target = to.join(entry.file_name());
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
