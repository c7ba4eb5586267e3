use dash_lab_abr::{SegmentTable, algorithm_by_name};
use dash_lab_abstract::{
    BUFFER_BYTES, CLIENT_START, MAX_PACKET_SIZE, NodeId, RunConfig, RunParameters, SERVER_PORT,
    SERVER_START, SetupError,
};
use serde::Serialize;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::apps::{StreamClientHelper, StreamServerHelper};
use crate::artifacts::{PCAP_PREFIX, prepare_artifact_directory};
use crate::engine::{AppHandle, Simulator};
use crate::link::attach_loss_model;
use crate::topology::{Interfaces, assign_addresses, build_topology};
use crate::trace::SimulationReport;
use crate::transport::{TransportConfig, apply_transport_defaults};

/// Outcome of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub artifact_dir: PathBuf,
    pub captures: Vec<PathBuf>,
    pub simulation: SimulationReport,
}

/// A fully assembled run: topology, stacks, addresses and applications,
/// waiting for [`Experiment::run`].
pub struct Experiment {
    config: RunConfig,
    artifact_dir: PathBuf,
    captures: Vec<PathBuf>,
    transport: TransportConfig,
    interfaces: Interfaces,
    server: AppHandle,
    clients: Vec<AppHandle>,
    simulator: Simulator,
}

fn log_banner(config: &RunConfig) {
    info!("Simulation ID: {}", config.simulation_id);
    info!("Adaptation algorithm: {}", config.adaptation_algo);
    info!("Transport protocol: {}", config.transport);
    info!("Link: {} / {}", config.data_rate, config.link_delay);
    info!(
        "Pacing: {}",
        if config.pacing_enabled { "enabled" } else { "disabled" }
    );
    info!("Error rate: {}", config.error_rate);
    info!("Segment sizes: {}", config.segment_size_file.display());
}

impl Experiment {
    /// Assemble a run. Any failure here is fatal and happens before simulated
    /// time advances. Configuration errors are reported before anything is
    /// written to disk.
    pub fn setup(config: &RunConfig) -> Result<Self, SetupError> {
        log_banner(config);
        // Everything the client is configured from is resolved before the
        // artifact directory or the topology exist.
        let table = SegmentTable::load(&config.segment_size_file, config.segment_duration)?;
        algorithm_by_name(&config.adaptation_algo)?;

        let artifact_dir =
            prepare_artifact_directory(&config.logs_dir, &config.adaptation_algo, config.simulation_id)?;

        let mut network = build_topology(config.data_rate, config.link_delay);
        if attach_loss_model(network.link_mut(), config.error_rate, config.seed) {
            info!("Receive error model on the client: rate {}", config.error_rate);
        }

        let transport = apply_transport_defaults(
            config.transport,
            MAX_PACKET_SIZE,
            BUFFER_BYTES,
            BUFFER_BYTES,
            config.pacing_rate(),
        );
        let captures = network.enable_pcap(&artifact_dir.join(PCAP_PREFIX))?;

        info!("Install Internet stack.");
        network.install_stack(&transport);
        let interfaces = assign_addresses(&mut network)?;

        info!("Create applications.");
        let mut simulator = Simulator::new(network);
        if let Some(stop) = config.stop_time {
            simulator.set_stop_time(stop);
        }

        let server = StreamServerHelper::new(SERVER_PORT).install(&mut simulator, NodeId::Server)?;
        simulator.set_start_time(&server, SERVER_START);

        let server_address = SocketAddrV4::new(interfaces.address(NodeId::Server), SERVER_PORT);
        let clients = StreamClientHelper::new(server_address, config.transport)
            .simulation_id(config.simulation_id)
            .segment_duration(config.segment_duration)
            .segment_size_file(&config.segment_size_file)
            .segment_table(table)
            .log_dir(&artifact_dir)
            .install(
                &mut simulator,
                &[(NodeId::Client, config.adaptation_algo.clone())],
            )?;
        for client in &clients {
            simulator.set_start_time(client, CLIENT_START);
        }

        Ok(Self {
            config: config.clone(),
            artifact_dir,
            captures,
            transport,
            interfaces,
            server,
            clients,
            simulator,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    pub fn server(&self) -> AppHandle {
        self.server
    }

    pub fn clients(&self) -> &[AppHandle] {
        &self.clients
    }

    /// Run to completion and tear everything down.
    pub fn run(mut self) -> RunReport {
        info!("Run Simulation.");
        info!("Sim ID: {}", self.config.simulation_id);
        info!("Client: {}", self.config.adaptation_algo);
        self.simulator.run();
        let simulation = self.simulator.teardown();
        info!("Done.");
        RunReport {
            config: self.config,
            artifact_dir: self.artifact_dir,
            captures: self.captures,
            simulation,
        }
    }
}

/// Validate `params`, assemble the run and execute it.
pub fn run_experiment(params: &RunParameters) -> Result<RunReport, SetupError> {
    let config = RunConfig::from_parameters(params)?;
    let experiment = Experiment::setup(&config)?;
    Ok(experiment.run())
}
