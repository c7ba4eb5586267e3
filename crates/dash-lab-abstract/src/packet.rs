use bytes::Bytes;
use std::net::SocketAddrV4;

use crate::config::TransportFamily;
use crate::interface::StreamId;

/// Header flags shared by both transport families.
pub mod flags {
    pub const SYN: u8 = 0x02;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

pub const PPP_HEADER_LEN: usize = 2;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// flags(1) + stream id(4) + seq(8) + ack(8) + window(4)
pub const STREAM_HEADER_LEN: usize = 25;

const PPP_PROTO_IPV4: u16 = 0x0021;
const IP_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub family: TransportFamily,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub flags: u8,
    /// Logical stream; always 0 for the reliable family.
    pub stream: StreamId,
    /// Byte offset of the first payload byte in the connection's send sequence.
    pub seq: u64,
    /// Next byte expected from the peer (cumulative).
    pub ack: u64,
    /// Advertised receive window in bytes.
    pub window: u32,
}

impl PacketHeader {
    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }
    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// A packet without payload (handshake or pure ACK).
    pub fn control(header: PacketHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Size of the frame on the link: PPP + IPv4 + transport header + payload.
    pub fn wire_len(&self) -> usize {
        PPP_HEADER_LEN + IPV4_HEADER_LEN + self.header.family.header_len() + self.payload.len()
    }

    /// Encode the PPP frame exactly as it would appear in a capture.
    pub fn encode_frame(&self) -> Vec<u8> {
        let h = &self.header;
        let mut frame = Vec::with_capacity(self.wire_len());
        frame.extend_from_slice(&PPP_PROTO_IPV4.to_be_bytes());

        let ip_len = IPV4_HEADER_LEN + h.family.header_len() + self.payload.len();
        let mut ip = [0u8; IPV4_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&saturate_u16(ip_len).to_be_bytes());
        ip[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
        ip[8] = IP_TTL;
        ip[9] = h.family.ip_protocol();
        ip[12..16].copy_from_slice(&h.src.ip().octets());
        ip[16..20].copy_from_slice(&h.dst.ip().octets());
        let sum = internet_checksum(&ip);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());
        frame.extend_from_slice(&ip);

        match h.family {
            TransportFamily::ReliableStream => {
                frame.extend_from_slice(&h.src.port().to_be_bytes());
                frame.extend_from_slice(&h.dst.port().to_be_bytes());
                frame.extend_from_slice(&(h.seq as u32).to_be_bytes());
                frame.extend_from_slice(&(h.ack as u32).to_be_bytes());
                frame.push(5 << 4);
                frame.push(h.flags);
                frame.extend_from_slice(&saturate_u16(h.window as usize).to_be_bytes());
                frame.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
            }
            TransportFamily::MultiplexedStream => {
                let udp_len = UDP_HEADER_LEN + STREAM_HEADER_LEN + self.payload.len();
                frame.extend_from_slice(&h.src.port().to_be_bytes());
                frame.extend_from_slice(&h.dst.port().to_be_bytes());
                frame.extend_from_slice(&saturate_u16(udp_len).to_be_bytes());
                frame.extend_from_slice(&[0, 0]);
                frame.push(h.flags);
                frame.extend_from_slice(&h.stream.0.to_be_bytes());
                frame.extend_from_slice(&h.seq.to_be_bytes());
                frame.extend_from_slice(&h.ack.to_be_bytes());
                frame.extend_from_slice(&h.window.to_be_bytes());
            }
        }

        frame.extend_from_slice(&self.payload);
        frame
    }
}

fn saturate_u16(value: usize) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// RFC 1071 ones'-complement checksum.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        let word = u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        sum = sum.wrapping_add(word);
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum = sum.wrapping_add((byte as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn header(family: TransportFamily) -> PacketHeader {
        PacketHeader {
            family,
            src: SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 80),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 49153),
            flags: flags::ACK | flags::PSH,
            stream: StreamId(8),
            seq: 5_000_000_000,
            ack: 17,
            window: 524_288,
        }
    }

    #[test]
    fn encoded_frame_matches_wire_len() {
        for family in [TransportFamily::ReliableStream, TransportFamily::MultiplexedStream] {
            let packet = Packet::new(header(family), Bytes::from_static(&[7u8; 100]));
            let frame = packet.encode_frame();
            assert_eq!(frame.len(), packet.wire_len());
            assert_eq!(&frame[frame.len() - 100..], &[7u8; 100][..]);
        }
    }

    #[test]
    fn ipv4_header_checksum_verifies() {
        let packet = Packet::control(header(TransportFamily::ReliableStream));
        let frame = packet.encode_frame();
        let ip = &frame[PPP_HEADER_LEN..PPP_HEADER_LEN + IPV4_HEADER_LEN];
        assert_eq!(internet_checksum(ip), 0);
        assert_eq!(ip[9], 6);
    }

    #[test]
    fn tcp_window_saturates() {
        let packet = Packet::control(header(TransportFamily::ReliableStream));
        let frame = packet.encode_frame();
        let tcp = &frame[PPP_HEADER_LEN + IPV4_HEADER_LEN..];
        assert_eq!(u16::from_be_bytes([tcp[14], tcp[15]]), u16::MAX);
        assert_eq!(tcp[13], flags::ACK | flags::PSH);
    }

    #[test]
    fn stream_header_carries_stream_id() {
        let packet = Packet::control(header(TransportFamily::MultiplexedStream));
        let frame = packet.encode_frame();
        let stream = &frame[PPP_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN..];
        assert_eq!(frame[PPP_HEADER_LEN + 9], 17);
        assert_eq!(stream[0], flags::ACK | flags::PSH);
        assert_eq!(u32::from_be_bytes([stream[1], stream[2], stream[3], stream[4]]), 8);
    }
}
