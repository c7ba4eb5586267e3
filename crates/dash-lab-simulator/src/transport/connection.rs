use bytes::Bytes;
use dash_lab_abstract::{
    CloseReason, Packet, PacketHeader, SimTime, StreamId, TransportDefaults, TransportFamily, flags,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddrV4;
use tracing::{debug, trace, warn};

use super::congestion::{NewReno, Pacer, RttEstimator};
use super::{Outbox, TimerKind, TransportConfig, TransportEvent, TransportStats};

/// Consecutive retransmission timeouts tolerated before the connection is abandoned.
const MAX_RETRIES: u32 = 6;
const INITIAL_WINDOW_SEGMENTS: usize = 10;
const DUPACK_THRESHOLD: u32 = 3;

fn min_rto(family: TransportFamily) -> SimTime {
    match family {
        TransportFamily::ReliableStream => SimTime::from_secs(1),
        TransportFamily::MultiplexedStream => SimTime::from_millis(200),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    SynSent,
    SynReceived,
    Established,
    Closed,
}

struct Chunk {
    seq: u64,
    stream: StreamId,
    data: Bytes,
    sent_at: Option<SimTime>,
    retransmitted: bool,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.seq + self.data.len() as u64
    }
}

pub(crate) struct Connection {
    family: TransportFamily,
    defaults: TransportDefaults,
    mss: usize,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    state: State,
    syn_sent_at: SimTime,

    // Send side. `chunks` holds every unacknowledged byte in sequence order;
    // entries before `next_chunk` are in flight.
    chunks: VecDeque<Chunk>,
    next_chunk: usize,
    snd_una: u64,
    snd_end: u64,
    stream_buffered: HashMap<StreamId, usize>,
    peer_window: u64,
    cc: NewReno,
    rtt: RttEstimator,
    pacer: Option<Pacer>,
    dup_acks: u32,
    recover: Option<u64>,
    retries: u32,
    rto_armed: bool,
    pacing_armed: bool,

    // Receive side.
    rcv_nxt: u64,
    out_of_order: BTreeMap<u64, (StreamId, Bytes)>,
    held_bytes: usize,

    stats: TransportStats,
}

impl Connection {
    fn new(config: &TransportConfig, local: SocketAddrV4, peer: SocketAddrV4, state: State) -> Self {
        let mss = config.family.payload_budget(config.defaults.max_packet_size);
        Self {
            family: config.family,
            defaults: config.defaults.clone(),
            mss,
            local,
            peer,
            state,
            syn_sent_at: SimTime::ZERO,
            chunks: VecDeque::new(),
            next_chunk: 0,
            snd_una: 0,
            snd_end: 0,
            stream_buffered: HashMap::new(),
            peer_window: config.defaults.socket_receive_buffer as u64,
            cc: NewReno::new(mss, INITIAL_WINDOW_SEGMENTS),
            rtt: RttEstimator::new(min_rto(config.family)),
            pacer: config.defaults.pacing_rate.map(Pacer::new),
            dup_acks: 0,
            recover: None,
            retries: 0,
            rto_armed: false,
            pacing_armed: false,
            rcv_nxt: 0,
            out_of_order: BTreeMap::new(),
            held_bytes: 0,
            stats: TransportStats::default(),
        }
    }

    /// Active open: send SYN.
    pub fn connect(
        config: &TransportConfig,
        local: SocketAddrV4,
        peer: SocketAddrV4,
        now: SimTime,
        out: &mut Outbox,
    ) -> Self {
        let mut conn = Self::new(config, local, peer, State::SynSent);
        conn.send_syn(now, out);
        conn
    }

    /// Passive open in response to `syn`: send SYN|ACK.
    pub fn accept(
        config: &TransportConfig,
        syn: &PacketHeader,
        now: SimTime,
        out: &mut Outbox,
    ) -> Self {
        let mut conn = Self::new(config, syn.dst, syn.src, State::SynReceived);
        conn.peer_window = u64::from(syn.window);
        conn.send_control(flags::SYN | flags::ACK, out);
        conn.arm_rto(now, out);
        conn
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        stats.cwnd = self.cc.window();
        stats.srtt = self.rtt.srtt();
        stats
    }

    pub fn is_multiplexed(&self) -> bool {
        self.family.is_multiplexed()
    }

    /// Whether `header` belongs to this connection.
    pub fn matches(&self, header: &PacketHeader) -> bool {
        header.dst == self.local && header.src == self.peer
    }

    /// Free send buffer space for `stream`: the socket limit, and for the
    /// multiplexed family also the per-stream limit.
    pub fn send_space(&self, stream: StreamId) -> usize {
        if self.state != State::Established {
            return 0;
        }
        let buffered = (self.snd_end - self.snd_una) as usize;
        let socket_free = self.defaults.socket_send_buffer.saturating_sub(buffered);
        if !self.is_multiplexed() {
            return socket_free;
        }
        let on_stream = self.stream_buffered.get(&stream).copied().unwrap_or(0);
        socket_free.min(self.defaults.stream_send_buffer.saturating_sub(on_stream))
    }

    pub fn write(&mut self, stream: StreamId, data: Bytes, now: SimTime, out: &mut Outbox) -> usize {
        let stream = if self.is_multiplexed() { stream } else { StreamId(0) };
        let accepted = self.send_space(stream).min(data.len());
        let mut offset = 0;
        while offset < accepted {
            let end = (offset + self.mss).min(accepted);
            self.chunks.push_back(Chunk {
                seq: self.snd_end,
                stream,
                data: data.slice(offset..end),
                sent_at: None,
                retransmitted: false,
            });
            self.snd_end += (end - offset) as u64;
            offset = end;
        }
        if accepted > 0 {
            *self.stream_buffered.entry(stream).or_default() += accepted;
            self.try_send(now, out);
        }
        accepted
    }

    pub fn on_packet(&mut self, packet: Packet, now: SimTime, out: &mut Outbox) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let Packet { header, payload } = packet;

        match self.state {
            State::Closed => return events,
            State::SynSent => {
                if header.is_syn() && header.is_ack() {
                    self.state = State::Established;
                    if self.retries == 0 {
                        self.rtt.sample(now - self.syn_sent_at);
                    }
                    self.retries = 0;
                    self.disarm_rto(out);
                    self.peer_window = u64::from(header.window);
                    self.send_control(flags::ACK, out);
                    match self.pacer.as_ref() {
                        Some(pacer) => debug!(
                            "{} -> {} established, pacing at {}",
                            self.local,
                            self.peer,
                            pacer.rate()
                        ),
                        None => debug!("{} -> {} established", self.local, self.peer),
                    }
                    events.push(TransportEvent::Connected);
                }
                return events;
            }
            State::SynReceived => {
                if header.is_syn() {
                    // SYN|ACK was lost on the way back
                    self.send_control(flags::SYN | flags::ACK, out);
                    return events;
                }
                if !header.is_ack() {
                    return events;
                }
                self.state = State::Established;
                self.retries = 0;
                self.disarm_rto(out);
                debug!("{} accepted {}", self.local, self.peer);
                events.push(TransportEvent::Accepted(self.peer));
            }
            State::Established => {
                if header.is_syn() {
                    let reply = if header.is_ack() {
                        flags::ACK
                    } else {
                        flags::SYN | flags::ACK
                    };
                    self.send_control(reply, out);
                    return events;
                }
            }
        }

        if header.is_ack() {
            self.peer_window = u64::from(header.window);
            self.process_ack(header.ack, payload.is_empty(), now, out, &mut events);
        }
        if !payload.is_empty() {
            self.receive_data(header.seq, header.stream, payload, &mut events);
            self.send_control(flags::ACK, out);
        }
        if self.state == State::Established {
            self.try_send(now, out);
        }
        events
    }

    pub fn on_timer(&mut self, kind: TimerKind, now: SimTime, out: &mut Outbox) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        match kind {
            TimerKind::Pacing => {
                self.pacing_armed = false;
                self.try_send(now, out);
            }
            TimerKind::Retransmit => {
                self.rto_armed = false;
                match self.state {
                    State::SynSent | State::SynReceived => {
                        self.retries += 1;
                        if self.retries > MAX_RETRIES {
                            warn!("{} -> {}: handshake failed", self.local, self.peer);
                            self.abort(out);
                            events.push(TransportEvent::Closed(CloseReason::ConnectFailed));
                            return events;
                        }
                        self.stats.timeouts += 1;
                        self.rtt.backoff();
                        if self.state == State::SynSent {
                            self.send_syn(now, out);
                        } else {
                            self.send_control(flags::SYN | flags::ACK, out);
                            self.arm_rto(now, out);
                        }
                    }
                    State::Established if self.flight() > 0 => {
                        self.retries += 1;
                        if self.retries > MAX_RETRIES {
                            warn!("{} -> {}: too many retransmissions", self.local, self.peer);
                            self.abort(out);
                            events.push(TransportEvent::Closed(CloseReason::TimedOut));
                            return events;
                        }
                        self.stats.timeouts += 1;
                        debug!(
                            "{} -> {}: RTO with {} bytes in flight",
                            self.local,
                            self.peer,
                            self.flight()
                        );
                        self.cc.on_timeout(self.flight());
                        self.rtt.backoff();
                        debug!(
                            "{} -> {}: ssthresh now {}",
                            self.local,
                            self.peer,
                            self.cc.ssthresh()
                        );
                        self.recover = None;
                        self.dup_acks = 0;
                        self.next_chunk = 0;
                        self.try_send(now, out);
                        if !self.rto_armed {
                            self.arm_rto(now, out);
                        }
                    }
                    _ => {}
                }
            }
        }
        events
    }

    fn flight(&self) -> u64 {
        let snd_nxt = self
            .chunks
            .get(self.next_chunk)
            .map_or(self.snd_end, |chunk| chunk.seq);
        snd_nxt - self.snd_una
    }

    fn process_ack(
        &mut self,
        ack: u64,
        pure: bool,
        now: SimTime,
        out: &mut Outbox,
        events: &mut Vec<TransportEvent>,
    ) {
        let ack = ack.min(self.snd_end);
        if ack > self.snd_una {
            let flight_before = self.flight();
            let mut acked = 0usize;
            let mut popped = 0usize;
            let mut sample = None;
            while let Some(front) = self.chunks.front() {
                if front.end() > ack {
                    break;
                }
                let Some(chunk) = self.chunks.pop_front() else {
                    break;
                };
                acked += chunk.data.len();
                popped += 1;
                if let Some(buffered) = self.stream_buffered.get_mut(&chunk.stream) {
                    *buffered = buffered.saturating_sub(chunk.data.len());
                    if *buffered == 0 {
                        self.stream_buffered.remove(&chunk.stream);
                    }
                }
                if !chunk.retransmitted
                    && let Some(sent_at) = chunk.sent_at
                {
                    sample = Some(now - sent_at);
                }
            }
            if popped == 0 {
                return;
            }
            self.snd_una = self.chunks.front().map_or(self.snd_end, |chunk| chunk.seq);
            self.next_chunk = self.next_chunk.saturating_sub(popped);
            if let Some(rtt) = sample {
                self.rtt.sample(rtt);
            }
            self.retries = 0;
            self.dup_acks = 0;
            self.stats.bytes_acked += acked as u64;

            match self.recover {
                Some(recover) if ack < recover => {
                    trace!("partial ack {ack}, recovery point {recover}");
                    self.retransmit_front(now, out);
                }
                Some(_) => self.recover = None,
                None => self.cc.on_ack(acked),
            }

            if self.flight() > 0 {
                self.arm_rto(now, out);
            } else {
                self.disarm_rto(out);
            }
            trace!("ack {ack}: {acked} bytes, flight {flight_before} -> {}", self.flight());
            events.push(TransportEvent::SendSpace);
        } else if ack == self.snd_una && pure && self.flight() > 0 {
            self.dup_acks += 1;
            if self.dup_acks == DUPACK_THRESHOLD && self.recover.is_none() {
                let flight = self.flight();
                self.cc.on_triple_dupack(flight);
                self.recover = Some(self.snd_una + flight);
                self.stats.fast_retransmits += 1;
                debug!(
                    "{} -> {}: fast retransmit at {}, ssthresh {}",
                    self.local,
                    self.peer,
                    self.snd_una,
                    self.cc.ssthresh()
                );
                self.retransmit_front(now, out);
            }
        }
    }

    fn receive_data(&mut self, seq: u64, stream: StreamId, payload: Bytes, events: &mut Vec<TransportEvent>) {
        let end = seq + payload.len() as u64;
        if end <= self.rcv_nxt {
            return;
        }
        if seq > self.rcv_nxt {
            let capacity = self.receive_capacity() as u64;
            if end - self.rcv_nxt <= capacity && !self.out_of_order.contains_key(&seq) {
                self.held_bytes += payload.len();
                self.out_of_order.insert(seq, (stream, payload));
            }
            return;
        }

        self.deliver(seq, stream, payload, events);
        while let Some(entry) = self.out_of_order.first_entry() {
            if *entry.key() > self.rcv_nxt {
                break;
            }
            let (seq, (stream, data)) = entry.remove_entry();
            self.held_bytes -= data.len();
            self.deliver(seq, stream, data, events);
        }
    }

    /// Hand the part of `data` beyond `rcv_nxt` to the application.
    fn deliver(&mut self, seq: u64, stream: StreamId, data: Bytes, events: &mut Vec<TransportEvent>) {
        let end = seq + data.len() as u64;
        if end <= self.rcv_nxt {
            return;
        }
        let skip = (self.rcv_nxt - seq) as usize;
        let fresh = data.slice(skip..);
        self.rcv_nxt = end;
        self.stats.bytes_delivered += fresh.len() as u64;
        events.push(TransportEvent::Data(stream, fresh));
    }

    fn receive_capacity(&self) -> usize {
        if self.is_multiplexed() {
            self.defaults
                .socket_receive_buffer
                .min(self.defaults.stream_receive_buffer)
        } else {
            self.defaults.socket_receive_buffer
        }
    }

    fn advertised_window(&self) -> u32 {
        let free = self.receive_capacity().saturating_sub(self.held_bytes);
        u32::try_from(free).unwrap_or(u32::MAX)
    }

    fn try_send(&mut self, now: SimTime, out: &mut Outbox) {
        if self.state != State::Established {
            return;
        }
        while self.next_chunk < self.chunks.len() {
            let len = self.chunks[self.next_chunk].data.len() as u64;
            let flight = self.flight();
            let window = (self.cc.window() as u64).min(self.peer_window);
            if flight > 0 && flight + len > window {
                break;
            }
            if let Some(departure) = self.pacer.as_ref().map(Pacer::next_departure)
                && now < departure
            {
                if !self.pacing_armed {
                    out.arm(TimerKind::Pacing, departure);
                    self.pacing_armed = true;
                }
                break;
            }

            let packet = self.emit(self.next_chunk, now);
            if let Some(pacer) = self.pacer.as_mut() {
                pacer.on_departure(now, packet.wire_len());
            }
            self.transmit(packet, out);
            self.next_chunk += 1;
            if !self.rto_armed {
                self.arm_rto(now, out);
            }
        }
    }

    /// Build the data packet for chunk `index` and stamp its send time.
    fn emit(&mut self, index: usize, now: SimTime) -> Packet {
        let ack = self.rcv_nxt;
        let window = self.advertised_window();
        let family = self.family;
        let (local, peer) = (self.local, self.peer);
        let chunk = &mut self.chunks[index];
        if chunk.sent_at.is_some() {
            chunk.retransmitted = true;
            self.stats.retransmissions += 1;
        }
        chunk.sent_at = Some(now);
        let header = PacketHeader {
            family,
            src: local,
            dst: peer,
            flags: flags::ACK | flags::PSH,
            stream: chunk.stream,
            seq: chunk.seq,
            ack,
            window,
        };
        self.stats.data_packets_sent += 1;
        Packet::new(header, chunk.data.clone())
    }

    fn retransmit_front(&mut self, now: SimTime, out: &mut Outbox) {
        let in_flight = self
            .chunks
            .front()
            .is_some_and(|chunk| chunk.sent_at.is_some());
        if !in_flight {
            return;
        }
        let packet = self.emit(0, now);
        self.transmit(packet, out);
        if !self.rto_armed {
            self.arm_rto(now, out);
        }
    }

    fn send_syn(&mut self, now: SimTime, out: &mut Outbox) {
        self.syn_sent_at = now;
        self.send_control(flags::SYN, out);
        self.arm_rto(now, out);
    }

    fn send_control(&mut self, flag_bits: u8, out: &mut Outbox) {
        let header = PacketHeader {
            family: self.family,
            src: self.local,
            dst: self.peer,
            flags: flag_bits,
            stream: StreamId(0),
            seq: self.snd_end.min(self.snd_una + self.flight()),
            ack: self.rcv_nxt,
            window: self.advertised_window(),
        };
        self.transmit(Packet::control(header), out);
    }

    fn transmit(&mut self, packet: Packet, out: &mut Outbox) {
        self.stats.packets_sent += 1;
        out.send(packet);
    }

    fn arm_rto(&mut self, now: SimTime, out: &mut Outbox) {
        out.arm(TimerKind::Retransmit, now + self.rtt.rto());
        self.rto_armed = true;
    }

    fn disarm_rto(&mut self, out: &mut Outbox) {
        if self.rto_armed {
            out.cancel(TimerKind::Retransmit);
            self.rto_armed = false;
        }
    }

    fn abort(&mut self, out: &mut Outbox) {
        self.state = State::Closed;
        self.chunks.clear();
        self.next_chunk = 0;
        self.stream_buffered.clear();
        self.disarm_rto(out);
        if self.pacing_armed {
            out.cancel(TimerKind::Pacing);
            self.pacing_armed = false;
        }
    }
}
