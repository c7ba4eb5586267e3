use dash_lab_abstract::{DataRate, SimTime};

/// NewReno window arithmetic in bytes. Recovery bookkeeping lives in the connection.
#[derive(Debug, Clone)]
pub(crate) struct NewReno {
    mss: usize,
    cwnd: usize,
    ssthresh: usize,
}

impl NewReno {
    pub fn new(mss: usize, initial_segments: usize) -> Self {
        Self {
            mss,
            cwnd: mss * initial_segments,
            ssthresh: usize::MAX,
        }
    }

    pub fn window(&self) -> usize {
        self.cwnd
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn on_ack(&mut self, acked: usize) {
        if self.cwnd < self.ssthresh {
            self.cwnd += acked.min(self.mss);
        } else {
            self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
        }
    }

    /// Fast retransmit: halve the flight and continue from there.
    pub fn on_triple_dupack(&mut self, flight: u64) {
        self.ssthresh = self.half_flight(flight);
        self.cwnd = self.ssthresh;
    }

    /// Retransmission timeout: back to one segment.
    pub fn on_timeout(&mut self, flight: u64) {
        self.ssthresh = self.half_flight(flight);
        self.cwnd = self.mss;
    }

    fn half_flight(&self, flight: u64) -> usize {
        ((flight / 2) as usize).max(2 * self.mss)
    }
}

/// RFC 6298 round-trip estimation with exponential backoff.
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    srtt: Option<u64>,
    rttvar: u64,
    rto: SimTime,
    min_rto: SimTime,
    max_rto: SimTime,
}

const INITIAL_RTO: SimTime = SimTime::from_secs(1);
const MAX_RTO: SimTime = SimTime::from_secs(60);
const CLOCK_GRANULARITY: u64 = 1_000_000; // 1 ms

impl RttEstimator {
    pub fn new(min_rto: SimTime) -> Self {
        Self {
            srtt: None,
            rttvar: 0,
            rto: INITIAL_RTO.max(min_rto),
            min_rto,
            max_rto: MAX_RTO,
        }
    }

    pub fn rto(&self) -> SimTime {
        self.rto
    }

    pub fn srtt(&self) -> Option<SimTime> {
        self.srtt.map(SimTime::from_nanos)
    }

    pub fn sample(&mut self, rtt: SimTime) {
        let r = rtt.as_nanos();
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                self.rttvar = (3 * self.rttvar + srtt.abs_diff(r)) / 4;
                self.srtt = Some((7 * srtt + r) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(r);
        let rto = SimTime::from_nanos(srtt + CLOCK_GRANULARITY.max(4 * self.rttvar));
        self.rto = rto.max(self.min_rto).min(self.max_rto);
    }

    pub fn backoff(&mut self) {
        self.rto = self.rto.saturating_mul(2).min(self.max_rto);
    }
}

/// Spaces departures so that the sender never exceeds `rate`.
#[derive(Debug, Clone)]
pub(crate) struct Pacer {
    rate: DataRate,
    next_departure: SimTime,
}

impl Pacer {
    pub fn new(rate: DataRate) -> Self {
        Self {
            rate,
            next_departure: SimTime::ZERO,
        }
    }

    pub fn rate(&self) -> DataRate {
        self.rate
    }

    pub fn next_departure(&self) -> SimTime {
        self.next_departure
    }

    pub fn on_departure(&mut self, now: SimTime, wire_bytes: usize) {
        self.next_departure = now + self.rate.tx_time(wire_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: usize = 1446;

    #[test]
    fn slow_start_then_avoidance() {
        let mut cc = NewReno::new(MSS, 10);
        assert_eq!(cc.window(), 10 * MSS);
        cc.on_ack(MSS);
        assert_eq!(cc.window(), 11 * MSS);

        cc.on_triple_dupack(20 * MSS as u64);
        assert_eq!(cc.window(), 10 * MSS);
        assert_eq!(cc.ssthresh(), 10 * MSS);
        cc.on_ack(MSS);
        assert_eq!(cc.window(), 10 * MSS + MSS / 10);
    }

    #[test]
    fn timeout_collapses_window() {
        let mut cc = NewReno::new(MSS, 10);
        cc.on_timeout(3 * MSS as u64);
        assert_eq!(cc.window(), MSS);
        assert_eq!(cc.ssthresh(), 2 * MSS);
    }

    #[test]
    fn rto_respects_floor_and_backoff() {
        let mut rtt = RttEstimator::new(SimTime::from_millis(200));
        assert_eq!(rtt.rto(), SimTime::from_secs(1));
        rtt.sample(SimTime::from_millis(10));
        // 10 ms + 4 * 5 ms is below the floor
        assert_eq!(rtt.rto(), SimTime::from_millis(200));
        assert_eq!(rtt.srtt(), Some(SimTime::from_millis(10)));

        rtt.backoff();
        assert_eq!(rtt.rto(), SimTime::from_millis(400));
        for _ in 0..20 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), SimTime::from_secs(60));
    }

    #[test]
    fn rto_tracks_large_samples() {
        let mut rtt = RttEstimator::new(SimTime::from_secs(1));
        rtt.sample(SimTime::from_secs(2));
        assert_eq!(rtt.rto(), SimTime::from_secs(6));
    }

    #[test]
    fn pacer_spaces_by_serialization_time() {
        let mut pacer = Pacer::new(DataRate::from_bps(8_000_000).unwrap());
        pacer.on_departure(SimTime::from_secs(1), 1000);
        assert_eq!(pacer.next_departure(), SimTime::from_secs(1) + SimTime::from_millis(1));
    }
}
