pub mod apps;
pub mod artifacts;
pub mod engine;
pub mod experiment;
pub mod link;
pub mod pcap;
pub mod sweep;
pub mod topology;
pub mod trace;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use apps::{SegmentServer, StreamClientHelper, StreamServerHelper, StreamingClient};
pub use artifacts::{PCAP_PREFIX, prepare_artifact_directory};
pub use engine::{AppHandle, Simulator};
pub use experiment::{Experiment, RunReport, run_experiment};
pub use link::{PointToPointLink, RateErrorModel, attach_loss_model};
pub use sweep::{SweepSummary, run_sweep};
pub use topology::{Interfaces, Ipv4AddressHelper, Network, assign_addresses, build_topology};
pub use trace::SimulationReport;
pub use transport::{TransportConfig, TransportConfigurator, apply_transport_defaults};
