use dash_lab_abstract::{NodeId, SimTime, TransportFamily};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::link::DeviceStats;
use crate::transport::TransportStats;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub node: NodeId,
    pub stats: DeviceStats,
    /// Receive error rate, when a loss model is attached.
    pub loss_rate: Option<f64>,
    pub capture: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportReport {
    pub node: NodeId,
    pub family: TransportFamily,
    pub stats: TransportStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub duration: SimTime,
    pub events_processed: u64,
    pub devices: Vec<DeviceReport>,
    pub transports: Vec<TransportReport>,
    pub metrics: BTreeMap<String, Vec<(SimTime, f64)>>,
}

impl SimulationReport {
    /// Return the (time, value) samples for a named metric, if present.
    pub fn metric_series(&self, name: &str) -> Option<&[(SimTime, f64)]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    pub fn device(&self, node: NodeId) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.node == node)
    }

    pub fn transport(&self, node: NodeId) -> Option<&TransportReport> {
        self.transports.iter().find(|t| t.node == node)
    }
}
