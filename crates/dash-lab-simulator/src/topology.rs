use dash_lab_abstract::{DataRate, NodeId, SetupError, SimTime};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::link::PointToPointLink;
use crate::pcap::PcapWriter;
use crate::transport::{TransportConfig, TransportStack};

pub struct Node {
    id: NodeId,
    address: Option<Ipv4Addr>,
    stack: Option<TransportStack>,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            address: None,
            stack: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn stack(&self) -> Option<&TransportStack> {
        self.stack.as_ref()
    }
}

/// Two hosts joined by one point-to-point link.
pub struct Network {
    nodes: [Node; 2],
    link: PointToPointLink,
}

/// Create the client and server nodes and connect them.
pub fn build_topology(data_rate: DataRate, delay: SimTime) -> Network {
    info!("Create nodes.");
    let nodes = NodeId::ALL.map(Node::new);
    info!("Create channels: {} / {}", data_rate, delay);
    Network {
        nodes,
        link: PointToPointLink::new(data_rate, delay),
    }
}

impl Network {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn link(&self) -> &PointToPointLink {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut PointToPointLink {
        &mut self.link
    }

    pub fn address(&self, id: NodeId) -> Option<Ipv4Addr> {
        self.node(id).address
    }

    /// Install a transport stack built from `config` on every node.
    pub fn install_stack(&mut self, config: &TransportConfig) {
        for node in &mut self.nodes {
            node.stack = Some(TransportStack::new(config.clone()));
        }
    }

    /// Capture every device to `<prefix>-<node>-0.pcap`.
    pub fn enable_pcap(&mut self, prefix: &Path) -> Result<Vec<PathBuf>, SetupError> {
        let mut paths = Vec::with_capacity(NodeId::ALL.len());
        for node in NodeId::ALL {
            let mut name = prefix.as_os_str().to_owned();
            name.push(format!("-{}-0.pcap", node.index()));
            let path = PathBuf::from(name);
            let writer = PcapWriter::create(&path)?;
            self.link.device_mut(node).enable_pcap(writer);
            paths.push(path);
        }
        Ok(paths)
    }

    pub(crate) fn stack_mut(&mut self, id: NodeId) -> Option<&mut TransportStack> {
        self.nodes[id.index()].stack.as_mut()
    }

    /// Address and stack of one node, borrowed together.
    pub(crate) fn host_mut(&mut self, id: NodeId) -> (Option<Ipv4Addr>, Option<&mut TransportStack>) {
        let node = &mut self.nodes[id.index()];
        (node.address, node.stack.as_mut())
    }

    pub(crate) fn flush_captures(&mut self) {
        for node in NodeId::ALL {
            self.link.device_mut(node).flush_capture();
        }
    }
}

/// Addresses assigned to the two interfaces of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interfaces {
    addresses: [Ipv4Addr; 2],
}

impl Interfaces {
    pub fn address(&self, node: NodeId) -> Ipv4Addr {
        self.addresses[node.index()]
    }
}

/// Sequential host addresses from one subnet, in node order.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4AddressHelper {
    base: Ipv4Addr,
    mask: Ipv4Addr,
}

impl Ipv4AddressHelper {
    pub fn new(base: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { base, mask }
    }

    pub fn assign(&self, network: &mut Network) -> Result<Interfaces, SetupError> {
        info!("Assign IP Addresses.");
        let mask = u32::from(self.mask);
        let subnet = u32::from(self.base) & mask;
        let needed = network.nodes.len();
        // host ids 1..=needed, leaving the all-ones broadcast address free
        if u64::from(!mask) < needed as u64 + 1 {
            return Err(SetupError::SubnetTooSmall {
                base: self.base.to_string(),
                mask: self.mask.to_string(),
                needed,
            });
        }
        let addresses = NodeId::ALL.map(|node| Ipv4Addr::from(subnet + 1 + node.index() as u32));
        for node in NodeId::ALL {
            network.nodes[node.index()].address = Some(addresses[node.index()]);
        }
        Ok(Interfaces { addresses })
    }
}

/// Assign the conventional `10.1.1.0/24` addresses.
pub fn assign_addresses(network: &mut Network) -> Result<Interfaces, SetupError> {
    Ipv4AddressHelper::new(Ipv4Addr::new(10, 1, 1, 0), Ipv4Addr::new(255, 255, 255, 0)).assign(network)
}
