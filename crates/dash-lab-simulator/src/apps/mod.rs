//! Streaming applications and the helpers that install them on nodes.

mod client;
mod logs;
mod server;

use dash_lab_abr::{SegmentTable, algorithm_by_name};
use dash_lab_abstract::{NodeId, SEGMENT_DURATION, SetupError, SimTime, TransportFamily};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::engine::{AppHandle, Simulator};

pub use client::StreamingClient;
pub use server::{REQUEST_LEN, SegmentServer};

use logs::ClientLogs;

/// Installs a [`SegmentServer`] listening on one port.
#[derive(Debug, Clone)]
pub struct StreamServerHelper {
    port: u16,
}

impl StreamServerHelper {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn install(&self, sim: &mut Simulator, node: NodeId) -> Result<AppHandle, SetupError> {
        sim.install_application(node, Box::new(SegmentServer::new(self.port)))
    }
}

/// Installs [`StreamingClient`]s that fetch from one server.
///
/// Each `(node, algorithm)` pair becomes one client; its index in the list is
/// its client id, which names its log files.
#[derive(Debug, Clone)]
pub struct StreamClientHelper {
    server: SocketAddrV4,
    family: TransportFamily,
    simulation_id: u32,
    segment_duration: SimTime,
    segment_size_file: PathBuf,
    table: Option<SegmentTable>,
    log_dir: PathBuf,
}

impl StreamClientHelper {
    pub fn new(server: SocketAddrV4, family: TransportFamily) -> Self {
        Self {
            server,
            family,
            simulation_id: 0,
            segment_duration: SEGMENT_DURATION,
            segment_size_file: PathBuf::new(),
            table: None,
            log_dir: PathBuf::from("."),
        }
    }

    /// Run id forwarded to every client for its own logging.
    pub fn simulation_id(mut self, id: u32) -> Self {
        self.simulation_id = id;
        self
    }

    pub fn segment_duration(mut self, duration: SimTime) -> Self {
        self.segment_duration = duration;
        self
    }

    pub fn segment_size_file(mut self, path: &Path) -> Self {
        self.segment_size_file = path.to_path_buf();
        self
    }

    /// Use an already loaded table instead of reading the segment size file.
    pub fn segment_table(mut self, table: SegmentTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn log_dir(mut self, dir: &Path) -> Self {
        self.log_dir = dir.to_path_buf();
        self
    }

    pub fn install(
        &self,
        sim: &mut Simulator,
        clients: &[(NodeId, String)],
    ) -> Result<Vec<AppHandle>, SetupError> {
        let table = match &self.table {
            Some(table) => table.clone(),
            None => SegmentTable::load(&self.segment_size_file, self.segment_duration)?,
        };
        info!(
            "Segment table {}: {} representations x {} segments",
            self.segment_size_file.display(),
            table.representations(),
            table.segments()
        );
        clients
            .iter()
            .enumerate()
            .map(|(client_id, (node, algo))| {
                let algorithm = algorithm_by_name(algo)?;
                let logs = ClientLogs::create(&self.log_dir, client_id)?;
                let client = StreamingClient::new(
                    self.simulation_id,
                    self.server,
                    self.family,
                    table.clone(),
                    algorithm,
                    logs,
                );
                sim.install_application(*node, Box::new(client))
            })
            .collect()
    }
}
