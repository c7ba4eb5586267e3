//! Reliable byte-stream transports carried over the simulated link.
//!
//! Both families share one connection engine (handshake, cumulative ACKs,
//! NewReno, RTO, optional pacing) and differ in header overhead, payload
//! budget, minimum RTO and whether streams are multiplexed.

mod congestion;
mod connection;

use bytes::Bytes;
use dash_lab_abstract::{
    CloseReason, DataRate, Packet, SimTime, StreamId, TransportDefaults, TransportError,
    TransportFamily,
};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, info};

use connection::Connection;

/// Builds the transport defaults applied identically to every node of a run.
#[derive(Debug, Clone)]
pub struct TransportConfigurator {
    family: TransportFamily,
    defaults: TransportDefaults,
}

impl TransportConfigurator {
    pub fn new(family: TransportFamily) -> Self {
        Self {
            family,
            defaults: TransportDefaults::default(),
        }
    }

    pub fn max_packet_size(mut self, bytes: usize) -> Self {
        self.defaults.max_packet_size = bytes;
        self
    }

    /// Socket send and receive buffers. Stream buffers follow unless set separately.
    pub fn buffers(mut self, send: usize, receive: usize) -> Self {
        self.defaults.socket_send_buffer = send;
        self.defaults.socket_receive_buffer = receive;
        self.defaults.stream_send_buffer = send;
        self.defaults.stream_receive_buffer = receive;
        self
    }

    /// Per-stream buffers of the multiplexed family.
    pub fn stream_buffers(mut self, send: usize, receive: usize) -> Self {
        self.defaults.stream_send_buffer = send;
        self.defaults.stream_receive_buffer = receive;
        self
    }

    pub fn pacing(mut self, rate: Option<DataRate>) -> Self {
        self.defaults.pacing_rate = rate;
        self
    }

    pub fn build(self) -> TransportConfig {
        TransportConfig {
            family: self.family,
            defaults: self.defaults,
        }
    }
}

/// The transport selection and defaults a [`crate::Network`] installs on its nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportConfig {
    pub family: TransportFamily,
    pub defaults: TransportDefaults,
}

/// Configure both transport families' defaults for a run and select `family`.
///
/// The same packet size and buffers are applied whichever family is selected;
/// the stream buffers of the multiplexed family equal its socket buffers.
pub fn apply_transport_defaults(
    family: TransportFamily,
    max_packet_size: usize,
    send_buffer: usize,
    receive_buffer: usize,
    pacing_rate: Option<DataRate>,
) -> TransportConfig {
    let config = TransportConfigurator::new(family)
        .max_packet_size(max_packet_size)
        .buffers(send_buffer, receive_buffer)
        .pacing(pacing_rate)
        .build();
    info!(
        "Transport {}: packet size {} B, buffers {}/{} B, pacing {}",
        family,
        max_packet_size,
        send_buffer,
        receive_buffer,
        match pacing_rate {
            Some(rate) => rate.to_string(),
            None => "off".to_string(),
        }
    );
    config
}

/// Counters kept per connection, reported at teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub data_packets_sent: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub bytes_acked: u64,
    pub bytes_delivered: u64,
    pub cwnd: usize,
    pub srtt: Option<SimTime>,
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Connected,
    Accepted(SocketAddrV4),
    Data(StreamId, Bytes),
    SendSpace,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Retransmit,
    Pacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerRequest {
    Arm(TimerKind, SimTime),
    Cancel(TimerKind),
}

/// Packets and timer requests produced by the stack during one event.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub packets: Vec<Packet>,
    pub timers: Vec<TimerRequest>,
}

impl Outbox {
    pub fn send(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn arm(&mut self, kind: TimerKind, at: SimTime) {
        self.timers.push(TimerRequest::Arm(kind, at));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.timers.push(TimerRequest::Cancel(kind));
    }
}

const FIRST_EPHEMERAL_PORT: u16 = 49153;

/// Per-node transport stack. Holds at most one connection: the client opens
/// one, the server accepts the first SYN on its listening port.
pub struct TransportStack {
    config: TransportConfig,
    listening: Option<u16>,
    connection: Option<Connection>,
    next_port: u16,
    outbox: Outbox,
}

impl TransportStack {
    pub(crate) fn new(config: TransportConfig) -> Self {
        Self {
            config,
            listening: None,
            connection: None,
            next_port: FIRST_EPHEMERAL_PORT,
            outbox: Outbox::default(),
        }
    }

    pub fn family(&self) -> TransportFamily {
        self.config.family
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.state() == connection::State::Established)
    }

    pub fn stats(&self) -> TransportStats {
        self.connection
            .as_ref()
            .map(Connection::stats)
            .unwrap_or_default()
    }

    pub(crate) fn listen(&mut self, port: u16) {
        self.listening = Some(port);
    }

    pub(crate) fn connect(
        &mut self,
        local: Option<Ipv4Addr>,
        peer: SocketAddrV4,
        now: SimTime,
    ) -> Result<(), TransportError> {
        let local = local.ok_or(TransportError::NoAddress)?;
        if self.connection.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        let local = SocketAddrV4::new(local, port);
        debug!("{} connecting to {} over {}", local, peer, self.config.family);
        self.connection = Some(Connection::connect(
            &self.config,
            local,
            peer,
            now,
            &mut self.outbox,
        ));
        Ok(())
    }

    pub(crate) fn write(&mut self, stream: StreamId, data: Bytes, now: SimTime) -> usize {
        match self.connection.as_mut() {
            Some(conn) => conn.write(stream, data, now, &mut self.outbox),
            None => 0,
        }
    }

    pub(crate) fn send_space(&self, stream: StreamId) -> usize {
        self.connection
            .as_ref()
            .map_or(0, |conn| conn.send_space(stream))
    }

    pub(crate) fn on_packet(&mut self, packet: Packet, now: SimTime) -> Vec<TransportEvent> {
        if packet.header.family != self.config.family {
            debug!("dropping {} packet on a {} stack", packet.header.family, self.config.family);
            return Vec::new();
        }
        match self.connection.as_mut() {
            Some(conn) if conn.matches(&packet.header) => {
                conn.on_packet(packet, now, &mut self.outbox)
            }
            Some(conn) => {
                debug!(
                    "{} ignoring packet from {}; connected to {}",
                    conn.local(),
                    packet.header.src,
                    conn.peer()
                );
                Vec::new()
            }
            None => {
                let header = &packet.header;
                if header.is_syn() && !header.is_ack() && self.listening == Some(header.dst.port()) {
                    debug!("{} accepting SYN from {}", header.dst, header.src);
                    self.connection = Some(Connection::accept(
                        &self.config,
                        header,
                        now,
                        &mut self.outbox,
                    ));
                } else {
                    debug!("no listener for packet to {}", header.dst);
                }
                Vec::new()
            }
        }
    }

    pub(crate) fn on_timer(&mut self, kind: TimerKind, now: SimTime) -> Vec<TransportEvent> {
        match self.connection.as_mut() {
            Some(conn) => conn.on_timer(kind, now, &mut self.outbox),
            None => Vec::new(),
        }
    }

    pub(crate) fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_lab_abstract::{BUFFER_BYTES, MAX_PACKET_SIZE};

    #[test]
    fn defaults_are_identical_for_both_families() {
        let tcp = apply_transport_defaults(
            TransportFamily::ReliableStream,
            MAX_PACKET_SIZE,
            BUFFER_BYTES,
            BUFFER_BYTES,
            None,
        );
        let quic = apply_transport_defaults(
            TransportFamily::MultiplexedStream,
            MAX_PACKET_SIZE,
            BUFFER_BYTES,
            BUFFER_BYTES,
            None,
        );
        assert_eq!(tcp.defaults, quic.defaults);
        assert_eq!(quic.defaults.stream_send_buffer, BUFFER_BYTES);
        assert_eq!(quic.defaults.stream_receive_buffer, BUFFER_BYTES);
        assert_ne!(tcp.family, quic.family);
    }

    #[test]
    fn pacing_rate_is_carried_through() {
        let rate: DataRate = "5Mbps".parse().unwrap();
        let config = apply_transport_defaults(
            TransportFamily::ReliableStream,
            MAX_PACKET_SIZE,
            BUFFER_BYTES,
            BUFFER_BYTES,
            Some(rate),
        );
        assert_eq!(config.defaults.pacing_rate, Some(rate));
    }

    #[test]
    fn connect_requires_an_address_and_is_single_shot() {
        let config = TransportConfigurator::new(TransportFamily::ReliableStream).build();
        let mut stack = TransportStack::new(config);
        let server = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 80);
        assert_eq!(
            stack.connect(None, server, SimTime::ZERO),
            Err(TransportError::NoAddress)
        );
        let local = Some(Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(stack.connect(local, server, SimTime::ZERO), Ok(()));
        assert_eq!(
            stack.connect(local, server, SimTime::ZERO),
            Err(TransportError::AlreadyConnected)
        );
        let outbox = stack.take_outbox();
        assert_eq!(outbox.packets.len(), 1);
        assert!(outbox.packets[0].header.is_syn());
        assert_eq!(outbox.packets[0].header.src.port(), FIRST_EPHEMERAL_PORT);
    }

    #[test]
    fn listener_accepts_one_connection() {
        let config = TransportConfigurator::new(TransportFamily::MultiplexedStream).build();
        let mut client = TransportStack::new(config.clone());
        let mut server = TransportStack::new(config);
        server.listen(80);
        let server_addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 80);
        client
            .connect(Some(Ipv4Addr::new(10, 1, 1, 1)), server_addr, SimTime::ZERO)
            .unwrap();

        let syn = client.take_outbox().packets.remove(0);
        server.on_packet(syn, SimTime::ZERO);
        let syn_ack = server.take_outbox().packets.remove(0);
        assert!(syn_ack.header.is_syn() && syn_ack.header.is_ack());

        let events = client.on_packet(syn_ack, SimTime::from_millis(4));
        assert!(matches!(events.as_slice(), [TransportEvent::Connected]));
        assert!(client.is_connected());
        let ack = client.take_outbox().packets.remove(0);
        let events = server.on_packet(ack, SimTime::from_millis(6));
        assert!(matches!(events.as_slice(), [TransportEvent::Accepted(peer)] if peer.port() == FIRST_EPHEMERAL_PORT));
    }

    #[test]
    fn wrong_family_is_dropped() {
        let tcp = TransportConfigurator::new(TransportFamily::ReliableStream).build();
        let quic = TransportConfigurator::new(TransportFamily::MultiplexedStream).build();
        let mut client = TransportStack::new(tcp);
        let mut server = TransportStack::new(quic);
        server.listen(80);
        client
            .connect(
                Some(Ipv4Addr::new(10, 1, 1, 1)),
                SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 80),
                SimTime::ZERO,
            )
            .unwrap();
        let syn = client.take_outbox().packets.remove(0);
        server.on_packet(syn, SimTime::ZERO);
        assert!(server.take_outbox().packets.is_empty());
    }

    mod over_the_link {
        use super::*;
        use crate::engine::Simulator;
        use crate::test_support::{Recorder, RecorderState, connected_network};
        use dash_lab_abstract::NodeId;
        use std::cell::RefCell;
        use std::rc::Rc;

        fn bulk(family: TransportFamily, bps: u64, loss: f64, bytes: usize) -> (Rc<RefCell<RecorderState>>, crate::SimulationReport) {
            let mut sim = Simulator::new(connected_network(family, bps, loss));
            let server = Recorder {
                listen: Some(80),
                to_send: bytes,
                stream: StreamId(0),
                ..Recorder::default()
            };
            let client = Recorder {
                connect: Some(SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 80)),
                ..Recorder::default()
            };
            let received = client.state.clone();
            let s = sim.install_application(NodeId::Server, Box::new(server)).unwrap();
            let c = sim.install_application(NodeId::Client, Box::new(client)).unwrap();
            sim.set_start_time(&s, SimTime::from_secs(1));
            sim.set_start_time(&c, SimTime::from_secs(2));
            sim.run();
            (received, sim.teardown())
        }

        #[test]
        fn lossless_transfer_is_complete_without_retransmissions() {
            let (state, report) = bulk(TransportFamily::ReliableStream, 10_000_000, 0.0, 2_000_000);
            assert_eq!(state.borrow().received, 2_000_000);
            let server = report.transport(NodeId::Server).unwrap();
            assert_eq!(server.stats.bytes_acked, 2_000_000);
            assert!(server.stats.srtt.is_some());
        }

        #[test]
        fn lossy_link_recovers_for_both_families() {
            for family in [TransportFamily::ReliableStream, TransportFamily::MultiplexedStream] {
                let (state, report) = bulk(family, 5_000_000, 0.02, 500_000);
                assert_eq!(state.borrow().received, 500_000, "{family}");
                let client_device = report.device(NodeId::Client).unwrap();
                assert!(client_device.stats.rx_error_drops > 0);
                let server = report.transport(NodeId::Server).unwrap();
                assert!(server.stats.retransmissions > 0);
            }
        }

        #[test]
        fn transfer_takes_at_least_serialization_time() {
            // 1 MB at 8 Mbps needs more than one second of link time
            let (state, _) = bulk(TransportFamily::ReliableStream, 8_000_000, 0.0, 1_000_000);
            let done = state.borrow().last_data_at.unwrap();
            assert!(done > SimTime::from_secs(3), "{done}");
        }
    }
}
