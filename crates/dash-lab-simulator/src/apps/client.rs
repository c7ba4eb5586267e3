use bytes::{BufMut, Bytes, BytesMut};
use dash_lab_abr::{AdaptationAlgorithm, AdaptationInput, DownloadRecord, SegmentTable};
use dash_lab_abstract::{AppContext, Application, CloseReason, SimTime, StreamId, TransportFamily};
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use tracing::{debug, info};

use super::logs::ClientLogs;
use super::server::REQUEST_LEN;

const REQUEST_TIMER: u32 = 1;
const PLAYBACK_TIMER: u32 = 2;

struct Download {
    segment: usize,
    representation: usize,
    stream: StreamId,
    expected: u64,
    received: u64,
    requested_at: SimTime,
    first_byte_at: Option<SimTime>,
}

enum Playback {
    NotStarted,
    Playing,
    Stalled { since: SimTime },
    Done,
}

/// Adaptive streaming client: downloads the segments of one video in order,
/// letting its adaptation algorithm pick each representation, and simulates
/// playback from the downloaded buffer.
pub struct StreamingClient {
    simulation_id: u32,
    server: SocketAddrV4,
    family: TransportFamily,
    table: SegmentTable,
    algorithm: Box<dyn AdaptationAlgorithm>,
    logs: ClientLogs,

    next_segment: usize,
    representation: usize,
    download: Option<Download>,
    pending_request: Option<(StreamId, Bytes)>,
    waiting: Option<usize>,
    failed: bool,
    downloads: Vec<DownloadRecord>,

    buffer: VecDeque<usize>,
    playback: Playback,
    played: usize,
    playing_until: SimTime,
    stalls: u32,
    stall_time: SimTime,
}

impl StreamingClient {
    pub(crate) fn new(
        simulation_id: u32,
        server: SocketAddrV4,
        family: TransportFamily,
        table: SegmentTable,
        algorithm: Box<dyn AdaptationAlgorithm>,
        logs: ClientLogs,
    ) -> Self {
        Self {
            simulation_id,
            server,
            family,
            table,
            algorithm,
            logs,
            next_segment: 0,
            representation: 0,
            download: None,
            pending_request: None,
            waiting: None,
            failed: false,
            downloads: Vec::new(),
            buffer: VecDeque::new(),
            playback: Playback::NotStarted,
            played: 0,
            playing_until: SimTime::ZERO,
            stalls: 0,
            stall_time: SimTime::ZERO,
        }
    }

    /// Seconds of video downloaded but not yet played.
    fn buffer_level(&self, now: SimTime) -> SimTime {
        let queued = self
            .table
            .segment_duration()
            .saturating_mul(self.buffer.len() as u64);
        match self.playback {
            Playback::Playing => queued + self.playing_until.saturating_sub(now),
            _ => queued,
        }
    }

    fn stream_for(&self, segment: usize) -> StreamId {
        if self.family.is_multiplexed() {
            // client-initiated bidirectional stream ids
            StreamId(4 * segment as u32)
        } else {
            StreamId(0)
        }
    }

    fn request_next(&mut self, ctx: &mut dyn AppContext) {
        if self.failed || self.download.is_some() || self.waiting.is_some() {
            return;
        }
        if self.next_segment >= self.table.segments() {
            return;
        }
        let now = ctx.now();
        let buffer_level = self.buffer_level(now);
        let input = AdaptationInput {
            segment: self.next_segment,
            now,
            downloads: &self.downloads,
            buffer_level,
            table: &self.table,
            current: self.representation,
        };
        let decision = self.algorithm.next(&input);
        let representation = decision.representation.min(self.table.highest());
        self.logs.adaptation.line(format_args!(
            "{}\t{:.6}\t{}\t{:.0}\t{:.6}\t{}",
            self.next_segment,
            now.as_secs_f64(),
            representation,
            self.table.bitrate(representation),
            decision.delay.as_secs_f64(),
            decision.reason
        ));

        if decision.delay.is_zero() {
            self.send_request(ctx, representation);
        } else {
            self.waiting = Some(representation);
            ctx.start_timer(decision.delay, REQUEST_TIMER);
        }
    }

    fn send_request(&mut self, ctx: &mut dyn AppContext, representation: usize) {
        let segment = self.next_segment;
        let stream = self.stream_for(segment);
        let expected = self.table.size(representation, segment);
        let mut request = BytesMut::with_capacity(REQUEST_LEN);
        request.put_u64(expected);

        self.representation = representation;
        self.download = Some(Download {
            segment,
            representation,
            stream,
            expected,
            received: 0,
            requested_at: ctx.now(),
            first_byte_at: None,
        });
        self.pending_request = Some((stream, request.freeze()));
        self.flush_request(ctx);
    }

    fn flush_request(&mut self, ctx: &mut dyn AppContext) {
        if let Some((stream, data)) = self.pending_request.take() {
            let sent = ctx.send(stream, data.clone());
            if sent < data.len() {
                self.pending_request = Some((stream, data.slice(sent..)));
            }
        }
    }

    fn complete_download(&mut self, ctx: &mut dyn AppContext, download: Download) {
        let now = ctx.now();
        let record = DownloadRecord {
            segment: download.segment,
            representation: download.representation,
            requested_at: download.requested_at,
            first_byte_at: download.first_byte_at.unwrap_or(now),
            completed_at: now,
            bytes: download.received,
        };
        let throughput = record.throughput_bps();
        self.logs.download.line(format_args!(
            "{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{}\t{:.0}",
            record.segment,
            record.representation,
            record.requested_at.as_secs_f64(),
            record.first_byte_at.as_secs_f64(),
            record.completed_at.as_secs_f64(),
            record.bytes,
            throughput
        ));
        ctx.record_metric("segment_bitrate", self.table.bitrate(record.representation));
        ctx.record_metric("segment_throughput", throughput);
        self.downloads.push(record);

        self.buffer.push_back(download.representation);
        self.next_segment += 1;
        self.log_buffer(ctx);

        match self.playback {
            Playback::NotStarted => {
                ctx.log("playback started");
                self.play_next(ctx);
            }
            Playback::Stalled { since } => {
                self.stall_time += now - since;
                ctx.log(&format!("stall ended after {}", now - since));
                self.play_next(ctx);
            }
            Playback::Playing | Playback::Done => {}
        }

        if self.next_segment == self.table.segments() {
            ctx.log("all segments downloaded");
        }
        self.request_next(ctx);
    }

    fn play_next(&mut self, ctx: &mut dyn AppContext) {
        let now = ctx.now();
        match self.buffer.pop_front() {
            Some(representation) => {
                let duration = self.table.segment_duration();
                self.logs.playback.line(format_args!(
                    "{}\t{}\t{:.6}",
                    self.played,
                    representation,
                    now.as_secs_f64()
                ));
                self.played += 1;
                self.playback = Playback::Playing;
                self.playing_until = now + duration;
                ctx.start_timer(duration, PLAYBACK_TIMER);
            }
            None if self.played >= self.table.segments() || self.failed => {
                self.playback = Playback::Done;
                ctx.log("playback finished");
            }
            None => {
                self.playback = Playback::Stalled { since: now };
                self.stalls += 1;
                ctx.record_metric("stall", f64::from(self.stalls));
                ctx.log(&format!("stall #{} at segment {}", self.stalls, self.played));
            }
        }
        self.log_buffer(ctx);
    }

    fn log_buffer(&mut self, ctx: &mut dyn AppContext) {
        let now = ctx.now();
        let level = self.buffer_level(now).as_secs_f64();
        self.logs
            .buffer
            .line(format_args!("{:.6}\t{:.3}", now.as_secs_f64(), level));
        ctx.record_metric("buffer_level", level);
    }
}

impl Application for StreamingClient {
    fn start(&mut self, ctx: &mut dyn AppContext) {
        ctx.log(&format!(
            "simulation {}: connecting to {} over {} with {}",
            self.simulation_id,
            self.server,
            self.family,
            self.algorithm.name()
        ));
        if let Err(err) = ctx.connect(self.server) {
            ctx.log(&format!("connect failed: {err}"));
            self.failed = true;
        }
    }

    fn on_connected(&mut self, ctx: &mut dyn AppContext) {
        ctx.log("connected");
        self.request_next(ctx);
    }

    fn on_data(&mut self, ctx: &mut dyn AppContext, stream: StreamId, data: Bytes) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        if stream != download.stream {
            return;
        }
        download.first_byte_at.get_or_insert(ctx.now());
        download.received += data.len() as u64;
        if download.received >= download.expected
            && let Some(done) = self.download.take()
        {
            self.complete_download(ctx, done);
        }
    }

    fn on_send_space(&mut self, ctx: &mut dyn AppContext) {
        self.flush_request(ctx);
    }

    fn on_timer(&mut self, ctx: &mut dyn AppContext, timer_id: u32) {
        match timer_id {
            REQUEST_TIMER => {
                if let Some(representation) = self.waiting.take() {
                    self.send_request(ctx, representation);
                }
            }
            PLAYBACK_TIMER => self.play_next(ctx),
            _ => {}
        }
    }

    fn on_closed(&mut self, ctx: &mut dyn AppContext, reason: CloseReason) {
        ctx.log(&format!("connection closed: {reason:?}"));
        self.failed = true;
        self.download = None;
        self.pending_request = None;
        if let Playback::Stalled { since } = self.playback {
            self.stall_time += ctx.now() - since;
            self.playback = Playback::Done;
        }
    }

    fn stop(&mut self) {
        self.logs.flush();
        debug!("Client logs: {:?}", self.logs.paths());
        info!(
            "Simulation {}: client downloaded {}/{} segments, played {}, {} stalls ({} stalled)",
            self.simulation_id,
            self.downloads.len(),
            self.table.segments(),
            self.played,
            self.stalls,
            self.stall_time
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::server::SegmentServer;
    use crate::engine::Simulator;
    use crate::test_support::connected_network;
    use dash_lab_abr::algorithm_by_name;
    use dash_lab_abstract::NodeId;
    use std::net::Ipv4Addr;

    fn run(family: TransportFamily, bps: u64, algo: &str, sizes: Vec<Vec<u64>>) -> (tempfile::TempDir, crate::SimulationReport) {
        let dir = tempfile::tempdir().unwrap();
        let table = SegmentTable::from_sizes(sizes, SimTime::from_secs(2)).unwrap();
        let logs = ClientLogs::create(dir.path(), 0).unwrap();
        let server_addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 80);
        let client = StreamingClient::new(1, server_addr, family, table, algorithm_by_name(algo).unwrap(), logs);

        let mut sim = Simulator::new(connected_network(family, bps, 0.0));
        let s = sim
            .install_application(NodeId::Server, Box::new(SegmentServer::new(80)))
            .unwrap();
        let c = sim.install_application(NodeId::Client, Box::new(client)).unwrap();
        sim.set_start_time(&s, SimTime::from_secs(1));
        sim.set_start_time(&c, SimTime::from_secs(2));
        sim.run();
        (dir, sim.teardown())
    }

    fn ladder(segments: usize) -> Vec<Vec<u64>> {
        [50_000u64, 100_000, 200_000]
            .iter()
            .map(|size| vec![*size; segments])
            .collect()
    }

    #[test]
    fn downloads_and_plays_every_segment() {
        let (dir, report) = run(TransportFamily::ReliableStream, 5_000_000, "festive", ladder(6));
        assert_eq!(report.metric_series("segment_bitrate").map(|s| s.len()), Some(6));

        let playback = std::fs::read_to_string(dir.path().join("cl0_playbackLog.txt")).unwrap();
        assert_eq!(playback.lines().count(), 1 + 6);
        let downloads = std::fs::read_to_string(dir.path().join("cl0_downloadLog.txt")).unwrap();
        assert_eq!(downloads.lines().count(), 1 + 6);
        // playback of six 2 s segments cannot finish before 12 s after the client started
        assert!(report.duration >= SimTime::from_secs(14));
    }

    #[test]
    fn multiplexed_family_uses_a_stream_per_segment() {
        let (_dir, report) = run(TransportFamily::MultiplexedStream, 5_000_000, "panda", ladder(4));
        assert_eq!(report.metric_series("segment_throughput").map(|s| s.len()), Some(4));
        let server = report.transport(NodeId::Server).unwrap();
        assert_eq!(server.family, TransportFamily::MultiplexedStream);
        assert!(server.stats.bytes_acked >= 4 * 50_000);
    }

    #[test]
    fn slow_link_stalls_playback() {
        // 200 kB segments over 400 kbps take 4 s each, twice their duration
        let sizes = vec![vec![200_000u64; 4]];
        let (_dir, report) = run(TransportFamily::ReliableStream, 400_000, "tobasco", sizes);
        let stalls = report.metric_series("stall").map_or(0, |s| s.len());
        assert!(stalls > 0);
    }
}
