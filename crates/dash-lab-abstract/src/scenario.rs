use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::RunParameters;

/// A grid of runs. Every field is optional in TOML and falls back to the
/// standard comparison grid.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SweepPlan {
    pub protocols: Vec<String>,
    pub algorithms: Vec<String>,
    pub data_rates: Vec<String>,
    pub pacing: Vec<bool>,
    pub error_rates: Vec<f64>,
    pub segment_size_file: PathBuf,
    pub logs_dir: PathBuf,
    pub seed: u64,
}

impl Default for SweepPlan {
    fn default() -> Self {
        let defaults = RunParameters::default();
        Self {
            protocols: strings(&["QUIC", "TCP"]),
            algorithms: strings(&["panda", "festive", "tobasco"]),
            data_rates: strings(&[
                "100Kbps", "500Kbps", "1Mbps", "2Mbps", "3Mbps", "4Mbps", "5Mbps", "10Mbps",
                "100Mbps", "500Mbps", "1Gbps",
            ]),
            pacing: vec![true, false],
            error_rates: vec![0.0],
            segment_size_file: defaults.segment_size_file,
            logs_dir: defaults.logs_dir,
            seed: defaults.seed,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl SweepPlan {
    pub fn len(&self) -> usize {
        self.protocols.len()
            * self.algorithms.len()
            * self.data_rates.len()
            * self.pacing.len()
            * self.error_rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enumerate runs protocol-major, then algorithm, rate, pacing and error rate,
    /// numbering them from 0.
    pub fn runs(&self) -> Vec<RunParameters> {
        let mut runs = Vec::with_capacity(self.len());
        let mut id = 0u32;
        for protocol in &self.protocols {
            for algorithm in &self.algorithms {
                for rate in &self.data_rates {
                    for &pacing in &self.pacing {
                        for &error_rate in &self.error_rates {
                            runs.push(RunParameters {
                                simulation_id: id,
                                adaptation_algo: algorithm.clone(),
                                transport_protocol: protocol.clone(),
                                data_rate: rate.clone(),
                                pacing_enabled: pacing,
                                error_rate,
                                segment_size_file: self.segment_size_file.clone(),
                                logs_dir: self.logs_dir.clone(),
                                seed: self.seed,
                                stop_time: None,
                            });
                            id += 1;
                        }
                    }
                }
            }
        }
        runs
    }
}
