use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use edge_bragg::codec::CodecKind;
use edge_bragg::config::{PipelineConfig, SimulatorConfig};
use edge_bragg::infer::ModelBackend;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EDGE_BRAGG_CONFIG",
        "EDGE_BRAGG_CHANNEL",
        "EDGE_BRAGG_SERVER_ADDR",
        "EDGE_BRAGG_MBSZ",
        "EDGE_BRAGG_PSZ",
        "EDGE_BRAGG_WORKERS",
        "EDGE_BRAGG_IDLE_SECS",
        "EDGE_BRAGG_MODEL_BACKEND",
        "EDGE_BRAGG_MODEL_PATH",
        "EDGE_BRAGG_ARCHIVE_PATH",
        "EDGE_BRAGG_MQTT_BROKER",
        "AD_SIM_CONFIG",
        "AD_SIM_CHANNEL",
        "AD_SIM_BIND_ADDR",
        "AD_SIM_INPUT_DIR",
        "AD_SIM_FRAME_RATE",
        "AD_SIM_RUNTIME_SECS",
        "AD_SIM_CODEC",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn pipeline_defaults_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.channel, "13SIM1:Pva1:Image");
    assert_eq!(cfg.mbsz, 1024);
    assert_eq!(cfg.psz, 15);
    assert_eq!(cfg.workers, 1);
    assert_eq!(cfg.min_peak_extent, 3);
    assert_eq!(cfg.idle_interval, Duration::from_secs(600));
    assert!(!cfg.flush_on_shutdown);
    assert!(cfg.high_watermark.is_none());
    assert_eq!(cfg.model.backend, ModelBackend::Centroid);
    assert!(cfg.archive.is_some());
    assert!(cfg.broadcast.is_none());
    assert!(cfg.live.is_none());
}

#[test]
fn pipeline_loads_json_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "channel": "det:image",
        "mbsz": 256,
        "psz": 11,
        "workers": 4,
        "min_intensity": 40.5,
        "idle_interval_secs": 30,
        "flush_on_shutdown": true,
        "high_watermark": 500,
        "model": { "backend": "stub" },
        "archive": { "path": "out/peaks.sqlite", "compression": true },
        "broadcast": { "broker": "mqtt://broker:1883", "topic": "bragg/out" },
        "live": { "channel": "bragg:live", "freq": 5 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("EDGE_BRAGG_CONFIG", file.path());
    std::env::set_var("EDGE_BRAGG_WORKERS", "2");
    std::env::set_var("EDGE_BRAGG_MODEL_PATH", "/models/bragg.onnx");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.channel, "det:image");
    assert_eq!(cfg.mbsz, 256);
    assert_eq!(cfg.psz, 11);
    assert_eq!(cfg.workers, 2);
    assert_eq!(cfg.min_intensity, 40.5);
    assert_eq!(cfg.idle_interval, Duration::from_secs(30));
    assert!(cfg.flush_on_shutdown);
    assert_eq!(cfg.high_watermark, Some(500));
    assert_eq!(cfg.model.backend, ModelBackend::Stub);
    assert_eq!(cfg.model.path, Some(PathBuf::from("/models/bragg.onnx")));
    let archive = cfg.archive.expect("archive");
    assert_eq!(archive.path, PathBuf::from("out/peaks.sqlite"));
    assert!(archive.compression);
    let broadcast = cfg.broadcast.expect("broadcast");
    assert_eq!(broadcast.broker, "mqtt://broker:1883");
    assert_eq!(broadcast.topic, "bragg/out");
    let live = cfg.live.expect("live");
    assert_eq!(live.channel, "bragg:live");
    assert_eq!(live.freq, 5.0);
    assert_eq!(live.bind_addr, "127.0.0.1:5076");

    clear_env();
}

#[test]
fn pipeline_rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EDGE_BRAGG_PSZ", "14");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("EDGE_BRAGG_PSZ", "15");
    std::env::set_var("EDGE_BRAGG_MBSZ", "0");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("EDGE_BRAGG_MBSZ", "many");
    assert!(PipelineConfig::load().is_err());

    clear_env();
}

#[test]
fn pipeline_disabling_the_archive() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "archive": { "enabled": false } }"#)
        .expect("write config");
    std::env::set_var("EDGE_BRAGG_CONFIG", file.path());
    let cfg = PipelineConfig::load().expect("load config");
    assert!(cfg.archive.is_none());

    clear_env();
}

#[test]
fn simulator_loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        channel = "sim:frames"
        frame_rate = 50.0
        nx = 64
        ny = 32
        runtime_secs = 12.5
        start_delay_secs = 0
        report_frequency = 10
        codec = "lz4"
    "#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("AD_SIM_CONFIG", file.path());
    std::env::set_var("AD_SIM_BIND_ADDR", "127.0.0.1:0");

    let cfg = SimulatorConfig::load().expect("load config");
    assert_eq!(cfg.channel, "sim:frames");
    assert_eq!(cfg.frame_rate, 50.0);
    assert_eq!((cfg.nx, cfg.ny), (64, 32));
    assert_eq!(cfg.runtime, Duration::from_millis(12_500));
    assert_eq!(cfg.start_delay, Duration::ZERO);
    assert_eq!(cfg.report_frequency, 10);
    assert_eq!(cfg.codec, CodecKind::Lz4);
    assert_eq!(cfg.bind_addr, "127.0.0.1:0");
    assert_eq!(cfg.period(), Some(Duration::from_millis(20)));

    clear_env();
}

#[test]
fn simulator_defaults_and_bad_codec() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SimulatorConfig::load().expect("load defaults");
    assert_eq!(cfg.channel, "simulation:pva:test");
    assert_eq!(cfg.frame_rate, 20.0);
    assert_eq!((cfg.nx, cfg.ny), (256, 256));
    assert_eq!(cfg.runtime, Duration::from_secs(300));
    assert_eq!(cfg.start_delay, Duration::from_secs(3));
    assert_eq!(cfg.report_frequency, 1);
    assert_eq!(cfg.codec, CodecKind::None);

    std::env::set_var("AD_SIM_CODEC", "blosc");
    assert!(SimulatorConfig::load().is_err());

    clear_env();
}
