use dash_lab_abstract::{
    BUFFER_BYTES, MAX_PACKET_SIZE, NodeId, RunConfig, RunParameters, SetupError, SimTime,
    TransportFamily,
};
use dash_lab_simulator::{Experiment, PCAP_PREFIX, run_experiment};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use tempfile::TempDir;

const SEGMENTS: usize = 5;

/// Three representations of five segments, written next to the logs root.
fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let rows: Vec<String> = [40_000u64, 90_000, 180_000]
        .iter()
        .map(|size| vec![size.to_string(); SEGMENTS].join(" "))
        .collect();
    fs::write(dir.path().join("segmentSizes.txt"), rows.join("\n")).unwrap();
    dir
}

fn params(dir: &Path, protocol: &str, algo: &str) -> RunParameters {
    RunParameters {
        simulation_id: 1,
        adaptation_algo: algo.to_string(),
        transport_protocol: protocol.to_string(),
        data_rate: "5Mbps".to_string(),
        pacing_enabled: false,
        error_rate: 0.0,
        segment_size_file: dir.join("segmentSizes.txt"),
        logs_dir: dir.join("logs"),
        seed: 1,
        stop_time: None,
    }
}

#[test]
fn tcp_festive_run_writes_artifacts_and_completes() {
    let dir = workspace();
    let report = run_experiment(&params(dir.path(), "TCP", "festive")).unwrap();

    let artifacts = dir.path().join("logs/festive/1");
    assert!(artifacts.is_dir());
    assert_eq!(report.artifact_dir, artifacts);
    for n in 0..2 {
        let pcap = artifacts.join(format!("{PCAP_PREFIX}-{n}-0.pcap"));
        assert!(fs::metadata(&pcap).unwrap().len() > 24, "{}", pcap.display());
    }
    for log in ["downloadLog", "playbackLog", "adaptationLog", "bufferLog"] {
        assert!(artifacts.join(format!("cl0_{log}.txt")).exists());
    }

    let sim = &report.simulation;
    assert_eq!(sim.metric_series("segment_bitrate").map(<[_]>::len), Some(SEGMENTS));
    assert!(sim.duration > SimTime::from_secs(2));
    let client = sim.device(NodeId::Client).unwrap();
    assert_eq!(client.loss_rate, None);
    assert_eq!(client.stats.rx_error_drops, 0);
}

#[test]
fn lower_case_quic_selects_the_multiplexed_family() {
    let dir = workspace();
    let mut p = params(dir.path(), "quic", "panda");
    p.simulation_id = 2;
    let report = run_experiment(&p).unwrap();
    assert_eq!(report.config.transport, TransportFamily::MultiplexedStream);
    assert!(dir.path().join("logs/panda/2").is_dir());
    let server = report.simulation.transport(NodeId::Server).unwrap();
    assert_eq!(server.family, TransportFamily::MultiplexedStream);
    assert_eq!(
        report.simulation.metric_series("segment_bitrate").map(<[_]>::len),
        Some(SEGMENTS)
    );
}

#[test]
fn unsupported_protocol_fails_before_touching_the_filesystem() {
    let dir = workspace();
    let err = run_experiment(&params(dir.path(), "UDP", "festive")).unwrap_err();
    assert!(matches!(&err, SetupError::UnsupportedProtocol(name) if name == "UDP"));
    assert_eq!(err.to_string(), "Protocol 'UDP' is not supported");
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn lossy_run_attaches_model_and_still_completes() {
    let dir = workspace();
    let mut p = params(dir.path(), "TCP", "tobasco");
    p.error_rate = 0.05;
    let report = run_experiment(&p).unwrap();
    let client = report.simulation.device(NodeId::Client).unwrap();
    assert_eq!(client.loss_rate, Some(0.05));
    assert!(client.stats.rx_error_drops > 0);
    // the server side receive path is never impaired
    let server = report.simulation.device(NodeId::Server).unwrap();
    assert_eq!(server.loss_rate, None);
    assert_eq!(
        report.simulation.metric_series("segment_bitrate").map(<[_]>::len),
        Some(SEGMENTS)
    );
}

#[test]
fn setup_is_complete_before_time_advances() {
    let dir = workspace();
    let mut p = params(dir.path(), "TCP", "festive");
    p.pacing_enabled = true;
    let config = RunConfig::from_parameters(&p).unwrap();
    let experiment = Experiment::setup(&config).unwrap();

    let sim = experiment.simulator();
    assert_eq!(sim.current_time(), SimTime::ZERO);
    let server_start = sim.start_time(&experiment.server()).unwrap();
    let client_start = sim.start_time(&experiment.clients()[0]).unwrap();
    assert!(server_start < client_start);
    assert_eq!(experiment.clients().len(), 1);

    let interfaces = experiment.interfaces();
    assert_eq!(interfaces.address(NodeId::Client), Ipv4Addr::new(10, 1, 1, 1));
    assert_eq!(interfaces.address(NodeId::Server), Ipv4Addr::new(10, 1, 1, 2));

    let network = sim.network();
    assert_eq!(network.link().delay(), SimTime::from_millis(2));
    assert_eq!(network.link().data_rate(), config.data_rate);

    let defaults = &experiment.transport().defaults;
    assert_eq!(defaults.max_packet_size, MAX_PACKET_SIZE);
    assert_eq!(defaults.socket_send_buffer, BUFFER_BYTES);
    assert_eq!(defaults.stream_receive_buffer, BUFFER_BYTES);
    assert_eq!(defaults.pacing_rate, Some(config.data_rate));
    for node in NodeId::ALL {
        let stack = network.node(node).stack().unwrap();
        assert_eq!(stack.config(), experiment.transport());
    }
}

#[test]
fn transport_defaults_do_not_depend_on_the_family() {
    let dir = workspace();
    let tcp = RunConfig::from_parameters(&params(dir.path(), "TCP", "festive")).unwrap();
    let mut quic_params = params(dir.path(), "QUIC", "festive");
    quic_params.simulation_id = 9;
    let quic = RunConfig::from_parameters(&quic_params).unwrap();

    let a = Experiment::setup(&tcp).unwrap();
    let b = Experiment::setup(&quic).unwrap();
    assert_eq!(a.transport().defaults, b.transport().defaults);
    assert_ne!(a.transport().family, b.transport().family);
}

#[test]
fn rerunning_the_same_id_reuses_the_directory() {
    let dir = workspace();
    let p = params(dir.path(), "TCP", "festive");
    run_experiment(&p).unwrap();
    let marker = dir.path().join("logs/festive/1/keep.txt");
    fs::write(&marker, "x").unwrap();
    run_experiment(&p).unwrap();
    assert!(marker.exists());
}

#[test]
fn stop_time_cuts_the_timeline() {
    let dir = workspace();
    let mut p = params(dir.path(), "TCP", "festive");
    // after the server started listening, before the client exists
    p.stop_time = Some(1.5);
    let report = run_experiment(&p).unwrap();
    assert_eq!(report.simulation.duration, SimTime::from_millis(1500));
    assert!(report.simulation.metric_series("segment_bitrate").is_none());
    let client = report.simulation.transport(NodeId::Client).unwrap();
    assert_eq!(client.stats.packets_sent, 0);
}

#[test]
fn missing_segment_table_is_a_resource_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_experiment(&params(dir.path(), "TCP", "festive")).unwrap_err();
    assert!(err.is_resource_error());
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn unknown_algorithm_fails_before_any_artifact_exists() {
    let dir = workspace();
    let err = run_experiment(&params(dir.path(), "TCP", "bola")).unwrap_err();
    assert!(matches!(&err, SetupError::UnknownAlgorithm(name) if name == "bola"));
    assert!(!err.is_resource_error());
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn malformed_segment_table_fails_before_any_artifact_exists() {
    let dir = workspace();
    fs::write(dir.path().join("segmentSizes.txt"), "100 200\n300\n").unwrap();
    let err = run_experiment(&params(dir.path(), "QUIC", "panda")).unwrap_err();
    assert!(matches!(err, SetupError::SegmentTable { .. }));
    assert!(!dir.path().join("logs").exists());
}
