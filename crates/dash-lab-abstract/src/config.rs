use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SetupError;
use crate::packet::{STREAM_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};
use crate::units::{DataRate, SimTime};

/// One-way propagation delay of the single link.
pub const LINK_DELAY: SimTime = SimTime::from_millis(2);
/// Playback duration of one segment (2,000,000 µs).
pub const SEGMENT_DURATION: SimTime = SimTime::from_micros(2_000_000);
/// Maximum transport packet size, shared by both families.
pub const MAX_PACKET_SIZE: usize = 1446;
/// Socket and stream buffer capacity, shared by both families.
pub const BUFFER_BYTES: usize = 524_288;
pub const SERVER_PORT: u16 = 80;
pub const SERVER_START: SimTime = SimTime::from_secs(1);
pub const CLIENT_START: SimTime = SimTime::from_secs(2);

const _: () = assert!(SERVER_START.as_nanos() < CLIENT_START.as_nanos());

/// The closed set of transport families a run can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportFamily {
    /// Single ordered byte stream per connection (TCP).
    #[serde(rename = "TCP")]
    ReliableStream,
    /// Several logical streams over one connection (QUIC).
    #[serde(rename = "QUIC")]
    MultiplexedStream,
}

impl TransportFamily {
    /// Case-insensitive match of a protocol name against the supported families.
    pub fn validate(name: &str) -> Result<Self, SetupError> {
        match name.to_ascii_uppercase().as_str() {
            "TCP" => Ok(TransportFamily::ReliableStream),
            "QUIC" => Ok(TransportFamily::MultiplexedStream),
            _ => Err(SetupError::UnsupportedProtocol(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportFamily::ReliableStream => "TCP",
            TransportFamily::MultiplexedStream => "QUIC",
        }
    }

    /// Bytes of transport header on the wire, excluding IP.
    pub fn header_len(&self) -> usize {
        match self {
            TransportFamily::ReliableStream => TCP_HEADER_LEN,
            TransportFamily::MultiplexedStream => UDP_HEADER_LEN + STREAM_HEADER_LEN,
        }
    }

    /// Payload bytes one packet can carry for a given maximum packet size.
    ///
    /// For the reliable family the maximum packet size is the segment size; for the
    /// multiplexed family it covers the stream header as well.
    pub fn payload_budget(&self, max_packet_size: usize) -> usize {
        match self {
            TransportFamily::ReliableStream => max_packet_size.max(1),
            TransportFamily::MultiplexedStream => {
                max_packet_size.saturating_sub(STREAM_HEADER_LEN).max(1)
            }
        }
    }

    pub fn ip_protocol(&self) -> u8 {
        match self {
            TransportFamily::ReliableStream => 6,
            TransportFamily::MultiplexedStream => 17,
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self, TransportFamily::MultiplexedStream)
    }
}

impl FromStr for TransportFamily {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)
    }
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport settings every socket and stream reads when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDefaults {
    pub max_packet_size: usize,
    pub socket_send_buffer: usize,
    pub socket_receive_buffer: usize,
    /// Per-stream limits, read by the multiplexed family only.
    pub stream_send_buffer: usize,
    pub stream_receive_buffer: usize,
    /// Pacing target; `None` disables pacing.
    pub pacing_rate: Option<DataRate>,
}

impl Default for TransportDefaults {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            socket_send_buffer: BUFFER_BYTES,
            socket_receive_buffer: BUFFER_BYTES,
            stream_send_buffer: BUFFER_BYTES,
            stream_receive_buffer: BUFFER_BYTES,
            pacing_rate: None,
        }
    }
}

/// Raw startup parameters, as supplied on the command line or in a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunParameters {
    pub simulation_id: u32,
    pub adaptation_algo: String,
    pub transport_protocol: String,
    pub data_rate: String,
    pub pacing_enabled: bool,
    pub error_rate: f64,
    pub segment_size_file: PathBuf,
    pub logs_dir: PathBuf,
    pub seed: u64,
    /// Optional hard stop for the timeline, in seconds.
    pub stop_time: Option<f64>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            simulation_id: 1,
            adaptation_algo: "festive".to_string(),
            transport_protocol: "TCP".to_string(),
            data_rate: "5Mbps".to_string(),
            pacing_enabled: false,
            error_rate: 0.0,
            segment_size_file: PathBuf::from("contrib/dash/segmentSizes.txt"),
            logs_dir: PathBuf::from("dash-log-files"),
            seed: 1,
            stop_time: None,
        }
    }
}

/// Immutable description of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub simulation_id: u32,
    pub adaptation_algo: String,
    pub transport: TransportFamily,
    pub data_rate: DataRate,
    pub link_delay: SimTime,
    pub error_rate: f64,
    pub pacing_enabled: bool,
    pub segment_duration: SimTime,
    pub segment_size_file: PathBuf,
    pub logs_dir: PathBuf,
    pub seed: u64,
    pub stop_time: Option<SimTime>,
}

impl RunConfig {
    /// Validate raw parameters. The protocol name is checked first so an
    /// unsupported transport is reported before anything else.
    pub fn from_parameters(params: &RunParameters) -> Result<Self, SetupError> {
        let transport = TransportFamily::validate(&params.transport_protocol)?;
        let data_rate: DataRate = params.data_rate.parse()?;

        if !(0.0..=1.0).contains(&params.error_rate) {
            return Err(SetupError::InvalidErrorRate(params.error_rate));
        }
        validate_algorithm_name(&params.adaptation_algo)?;

        Ok(Self {
            simulation_id: params.simulation_id,
            adaptation_algo: params.adaptation_algo.clone(),
            transport,
            data_rate,
            link_delay: LINK_DELAY,
            error_rate: params.error_rate,
            pacing_enabled: params.pacing_enabled,
            segment_duration: SEGMENT_DURATION,
            segment_size_file: params.segment_size_file.clone(),
            logs_dir: params.logs_dir.clone(),
            seed: params.seed,
            stop_time: params.stop_time.map(SimTime::from_secs_f64),
        })
    }

    /// Pacing tracks the bottleneck: when enabled the target is the link rate.
    pub fn pacing_rate(&self) -> Option<DataRate> {
        self.pacing_enabled.then_some(self.data_rate)
    }
}

// The algorithm name becomes a path component of the artifact directory.
fn validate_algorithm_name(name: &str) -> Result<(), SetupError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if bad {
        return Err(SetupError::InvalidAlgorithmName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_are_case_insensitive() {
        for name in ["TCP", "tcp", "Tcp", "tCP"] {
            assert_eq!(
                TransportFamily::validate(name).unwrap(),
                TransportFamily::ReliableStream
            );
        }
        for name in ["QUIC", "quic", "Quic", "qUiC"] {
            assert_eq!(
                TransportFamily::validate(name).unwrap(),
                TransportFamily::MultiplexedStream
            );
        }
    }

    #[test]
    fn unsupported_protocol_names_the_offender() {
        for name in ["UDP", "", "tcp ", "SCTP", "quic2"] {
            let err = TransportFamily::validate(name).unwrap_err();
            assert!(matches!(&err, SetupError::UnsupportedProtocol(n) if n == name));
            assert_eq!(err.to_string(), format!("Protocol '{name}' is not supported"));
        }
    }

    #[test]
    fn payload_budget_accounts_for_stream_header() {
        assert_eq!(TransportFamily::ReliableStream.payload_budget(1446), 1446);
        assert_eq!(
            TransportFamily::MultiplexedStream.payload_budget(1446),
            1446 - STREAM_HEADER_LEN
        );
    }

    #[test]
    fn run_config_rejects_protocol_before_other_fields() {
        let params = RunParameters {
            transport_protocol: "UDP".into(),
            data_rate: "garbage".into(),
            error_rate: 7.0,
            ..Default::default()
        };
        let err = RunConfig::from_parameters(&params).unwrap_err();
        assert!(matches!(err, SetupError::UnsupportedProtocol(_)));
    }

    #[test]
    fn run_config_checks_error_rate_range() {
        for rate in [-0.1, 1.01, f64::NAN] {
            let params = RunParameters {
                error_rate: rate,
                ..Default::default()
            };
            assert!(matches!(
                RunConfig::from_parameters(&params),
                Err(SetupError::InvalidErrorRate(_))
            ));
        }
    }

    #[test]
    fn run_config_rejects_path_like_algorithm_names() {
        for name in ["", "..", "a/b", "x\\y"] {
            let params = RunParameters {
                adaptation_algo: name.into(),
                ..Default::default()
            };
            assert!(matches!(
                RunConfig::from_parameters(&params),
                Err(SetupError::InvalidAlgorithmName(_))
            ));
        }
    }

    #[test]
    fn pacing_rate_equals_link_rate() {
        let params = RunParameters {
            data_rate: "5Mbps".into(),
            pacing_enabled: true,
            ..Default::default()
        };
        let config = RunConfig::from_parameters(&params).unwrap();
        assert_eq!(config.pacing_rate(), Some(config.data_rate));
        assert_eq!(config.pacing_rate().unwrap().to_string(), "5Mbps");

        let unpaced = RunConfig::from_parameters(&RunParameters::default()).unwrap();
        assert_eq!(unpaced.pacing_rate(), None);
    }

    #[test]
    fn fixed_constants() {
        let config = RunConfig::from_parameters(&RunParameters::default()).unwrap();
        assert_eq!(config.link_delay, SimTime::from_millis(2));
        assert_eq!(config.segment_duration.as_micros(), 2_000_000);
    }

    #[test]
    fn parameters_load_from_partial_toml() {
        let params: RunParameters = toml::from_str(
            r#"
            simulation_id = 7
            transport_protocol = "quic"
            pacing_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(params.simulation_id, 7);
        assert_eq!(params.data_rate, "5Mbps");
        let config = RunConfig::from_parameters(&params).unwrap();
        assert_eq!(config.transport, TransportFamily::MultiplexedStream);
    }
}
