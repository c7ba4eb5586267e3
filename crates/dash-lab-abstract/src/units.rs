use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use crate::error::SetupError;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Simulated time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Negative and non-finite inputs clamp to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self((secs * NANOS_PER_SEC as f64).min(u64::MAX as f64) as u64)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    pub const fn saturating_sub(self, other: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(other.0))
    }

    pub const fn saturating_mul(self, factor: u64) -> SimTime {
        SimTime(self.0.saturating_mul(factor))
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        *self = *self + rhs;
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// A link or pacing rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRate {
    bits_per_second: u64,
}

impl DataRate {
    /// Returns `None` for a zero rate; a link that never finishes a frame is meaningless.
    pub fn from_bps(bits_per_second: u64) -> Option<Self> {
        (bits_per_second > 0).then_some(Self { bits_per_second })
    }

    pub fn bits_per_second(&self) -> u64 {
        self.bits_per_second
    }

    /// Serialization delay of `bytes` at this rate, rounded up to the next nanosecond.
    pub fn tx_time(&self, bytes: usize) -> SimTime {
        let bits = bytes as u128 * 8 * NANOS_PER_SEC as u128;
        let rate = self.bits_per_second as u128;
        let nanos = bits.div_ceil(rate);
        SimTime::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    fn parse(value: &str) -> Result<Self, String> {
        let trimmed = value.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| "missing unit (e.g. 5Mbps)".to_string())?;
        let (number, unit) = trimmed.split_at(split);
        if number.is_empty() {
            return Err("missing numeric value".to_string());
        }
        let number: f64 = number
            .parse()
            .map_err(|_| format!("'{number}' is not a number"))?;

        let (prefix, base) = match unit {
            u if u.ends_with("bps") => (&u[..u.len() - 3], 1.0),
            u if u.ends_with("b/s") => (&u[..u.len() - 3], 1.0),
            u if u.ends_with("Bps") => (&u[..u.len() - 3], 8.0),
            u if u.ends_with("B/s") => (&u[..u.len() - 3], 8.0),
            other => return Err(format!("unknown unit '{other}'")),
        };
        let multiplier = match prefix {
            "" => 1.0,
            "k" | "K" => 1e3,
            "M" => 1e6,
            "G" => 1e9,
            other => return Err(format!("unknown unit prefix '{other}'")),
        };

        let bps = (number * multiplier * base).round();
        if !bps.is_finite() || bps < 1.0 || bps > u64::MAX as f64 {
            return Err("rate must be at least 1bps".to_string());
        }
        Ok(Self {
            bits_per_second: bps as u64,
        })
    }
}

impl FromStr for DataRate {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).map_err(|reason| SetupError::InvalidDataRate {
            value: s.to_string(),
            reason,
        })
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.bits_per_second;
        for (scale, unit) in [(1_000_000_000, "Gbps"), (1_000_000, "Mbps"), (1_000, "Kbps")] {
            if bps % scale == 0 {
                return write!(f, "{}{}", bps / scale, unit);
            }
        }
        write!(f, "{bps}bps")
    }
}

impl Serialize for DataRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DataRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The two endpoints of the topology. Index 0 is always the client, index 1 the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeId {
    Client,
    Server,
}

impl NodeId {
    pub const ALL: [NodeId; 2] = [NodeId::Client, NodeId::Server];

    pub fn index(&self) -> usize {
        match self {
            NodeId::Client => 0,
            NodeId::Server => 1,
        }
    }

    pub fn peer(&self) -> Self {
        match self {
            NodeId::Client => NodeId::Server,
            NodeId::Server => NodeId::Client,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_rates() {
        let cases = [
            ("100Kbps", 100_000),
            ("500kbps", 500_000),
            ("5Mbps", 5_000_000),
            ("1Gbps", 1_000_000_000),
            ("1.5Mbps", 1_500_000),
            ("800bps", 800),
            ("1MBps", 8_000_000),
            ("64b/s", 64),
        ];
        for (raw, expected) in cases {
            let rate: DataRate = raw.parse().unwrap();
            assert_eq!(rate.bits_per_second(), expected, "{raw}");
        }
    }

    #[test]
    fn rejects_malformed_rates() {
        for raw in ["", "Mbps", "5", "5Tbps", "0Mbps", "fast"] {
            let err = raw.parse::<DataRate>().unwrap_err();
            assert!(matches!(err, SetupError::InvalidDataRate { .. }), "{raw}");
        }
    }

    #[test]
    fn display_keeps_the_configured_spelling() {
        for raw in ["5Mbps", "100Kbps", "1Gbps", "800bps"] {
            assert_eq!(raw.parse::<DataRate>().unwrap().to_string(), raw);
        }
        assert_eq!("1.5Mbps".parse::<DataRate>().unwrap().to_string(), "1500Kbps");
    }

    #[test]
    fn tx_time_matches_rate() {
        let rate: DataRate = "8Mbps".parse().unwrap();
        // 1000 bytes = 8000 bits at 8e6 bit/s = 1ms
        assert_eq!(rate.tx_time(1000), SimTime::from_millis(1));
        let slow: DataRate = "3bps".parse().unwrap();
        assert_eq!(slow.tx_time(1), SimTime::from_nanos(2_666_666_667));
    }

    #[test]
    fn sim_time_conversions() {
        assert_eq!(SimTime::from_secs(2), SimTime::from_micros(2_000_000));
        assert_eq!(SimTime::from_secs_f64(1.5), SimTime::from_millis(1500));
        assert_eq!(SimTime::from_secs_f64(-3.0), SimTime::ZERO);
        assert_eq!(SimTime::from_millis(1) - SimTime::from_secs(1), SimTime::ZERO);
        assert_eq!(SimTime::from_millis(1500).to_string(), "1.500000s");
    }

    #[test]
    fn node_roles_are_fixed() {
        assert_eq!(NodeId::Client.index(), 0);
        assert_eq!(NodeId::Server.index(), 1);
        assert_eq!(NodeId::Client.peer(), NodeId::Server);
    }
}
