use dash_lab_abstract::{DataRate, NodeId, Packet, SimTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, trace};

use crate::pcap::PcapWriter;

/// Capacity of each device's drop-tail transmit queue, in packets.
pub const QUEUE_LIMIT: usize = 100;

/// Bernoulli packet corruption: every received packet is independently
/// discarded with probability `rate`.
#[derive(Debug)]
pub struct RateErrorModel {
    rate: f64,
    rng: StdRng,
}

impl RateErrorModel {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn corrupts(&mut self) -> bool {
        self.rng.random::<f64>() < self.rate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Packets discarded by the receive error model.
    pub rx_error_drops: u64,
    /// Packets rejected because the transmit queue was full.
    pub queue_drops: u64,
    pub max_queue_len: usize,
}

/// One end of the point-to-point link: a serializing transmitter with a
/// drop-tail queue, an optional receive error model and an optional capture.
pub struct NetDevice {
    node: NodeId,
    data_rate: DataRate,
    queue: VecDeque<Packet>,
    queue_limit: usize,
    busy: bool,
    receive_error_model: Option<RateErrorModel>,
    pcap: Option<PcapWriter>,
    stats: DeviceStats,
}

impl NetDevice {
    fn new(node: NodeId, data_rate: DataRate) -> Self {
        Self {
            node,
            data_rate,
            queue: VecDeque::new(),
            queue_limit: QUEUE_LIMIT,
            busy: false,
            receive_error_model: None,
            pcap: None,
            stats: DeviceStats::default(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn data_rate(&self) -> DataRate {
        self.data_rate
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn receive_error_model(&self) -> Option<&RateErrorModel> {
        self.receive_error_model.as_ref()
    }

    pub fn set_receive_error_model(&mut self, model: RateErrorModel) {
        self.receive_error_model = Some(model);
    }

    pub fn capture(&self) -> Option<&Path> {
        self.pcap.as_ref().map(PcapWriter::path)
    }

    pub(crate) fn enable_pcap(&mut self, writer: PcapWriter) {
        self.pcap = Some(writer);
    }

    /// Offer a packet for transmission. Returns it back when the transmitter is
    /// idle and the caller should start sending it right away.
    pub(crate) fn enqueue(&mut self, packet: Packet) -> Option<Packet> {
        if !self.busy {
            return Some(packet);
        }
        if self.queue.len() >= self.queue_limit {
            self.stats.queue_drops += 1;
            debug!(
                "[{:?}] queue full, dropping {} byte packet",
                self.node,
                packet.wire_len()
            );
            return None;
        }
        self.queue.push_back(packet);
        self.stats.max_queue_len = self.stats.max_queue_len.max(self.queue.len());
        None
    }

    /// Put `packet` on the wire and return its serialization time.
    pub(crate) fn begin_transmit(&mut self, now: SimTime, packet: &Packet) -> SimTime {
        self.busy = true;
        let bytes = packet.wire_len();
        self.stats.tx_packets += 1;
        self.stats.tx_bytes += bytes as u64;
        if let Some(pcap) = self.pcap.as_mut() {
            pcap.write(now, packet);
        }
        self.data_rate.tx_time(bytes)
    }

    /// The transmitter finished a packet. Returns the next queued packet, if any.
    pub(crate) fn transmit_complete(&mut self) -> Option<Packet> {
        self.busy = false;
        self.queue.pop_front()
    }

    /// Run a packet through the receive path. Returns false if it was corrupted.
    pub(crate) fn receive(&mut self, now: SimTime, packet: &Packet) -> bool {
        if let Some(model) = self.receive_error_model.as_mut()
            && model.corrupts()
        {
            self.stats.rx_error_drops += 1;
            trace!("[{:?}] error model dropped packet seq={}", self.node, packet.header.seq);
            return false;
        }
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += packet.wire_len() as u64;
        if let Some(pcap) = self.pcap.as_mut() {
            pcap.write(now, packet);
        }
        true
    }

    pub(crate) fn flush_capture(&mut self) {
        if let Some(pcap) = self.pcap.as_mut() {
            pcap.flush();
        }
    }
}

/// Full-duplex point-to-point link with one device per node.
pub struct PointToPointLink {
    devices: [NetDevice; 2],
    delay: SimTime,
}

impl PointToPointLink {
    pub fn new(data_rate: DataRate, delay: SimTime) -> Self {
        Self {
            devices: NodeId::ALL.map(|node| NetDevice::new(node, data_rate)),
            delay,
        }
    }

    pub fn delay(&self) -> SimTime {
        self.delay
    }

    pub fn data_rate(&self) -> DataRate {
        self.devices[0].data_rate
    }

    pub fn device(&self, node: NodeId) -> &NetDevice {
        &self.devices[node.index()]
    }

    pub fn device_mut(&mut self, node: NodeId) -> &mut NetDevice {
        &mut self.devices[node.index()]
    }
}

/// Attach a receive error model to the client's device when `probability` is
/// positive. Returns whether a model was attached.
pub fn attach_loss_model(link: &mut PointToPointLink, probability: f64, seed: u64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    link.device_mut(NodeId::Client)
        .set_receive_error_model(RateErrorModel::new(probability, seed));
    true
}
