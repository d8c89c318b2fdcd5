use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use image::{ImageBuffer, Luma};
use tempfile::tempdir;

use edge_bragg::channel::{ChannelServer, NdArrayRecord, RecordServer};
use edge_bragg::codec::CodecKind;
use edge_bragg::config::{ArchiveSettings, PipelineConfig, SimulatorConfig};
use edge_bragg::extract::{PatchExtractor, PeakPatchExtractor};
use edge_bragg::frame::PixelBuffer;
use edge_bragg::infer::{load_model, ModelBackend};
use edge_bragg::pipeline::run_pipeline;
use edge_bragg::sink::{ArchiveWriter, AsyncWriter, DatasetArchive, FanOut};
use edge_bragg::simulator::FrameSimulator;

const PEAKS: [(u32, u32); 4] = [(10, 10), (10, 50), (50, 10), (50, 50)];

/// 64x64 frame with four 3x3 peaks on a dark background.
fn write_peak_image(path: &Path) {
    let image: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(64, 64, |x, y| {
        let lit = PEAKS
            .iter()
            .any(|(py, px)| y.abs_diff(*py) <= 1 && x.abs_diff(*px) <= 1);
        let centre = PEAKS.iter().any(|(py, px)| y == *py && x == *px);
        match (lit, centre) {
            (_, true) => Luma([900]),
            (true, false) => Luma([400]),
            _ => Luma([5]),
        }
    });
    image.save(path).expect("save frame");
}

#[test]
fn simulated_frames_end_up_in_the_archive() {
    let dir = tempdir().expect("tempdir");
    let frames = dir.path().join("frames");
    std::fs::create_dir(&frames).expect("frames dir");
    write_peak_image(&frames.join("frame_000.png"));
    let archive_path = dir.path().join("out").join("peaks.sqlite");

    let server = Arc::new(ChannelServer::bind("127.0.0.1:0").expect("bind"));
    let addr = server.local_addr().to_string();
    let records: Arc<dyn RecordServer> = server.clone();
    let sim_config = SimulatorConfig {
        channel: "e2e".into(),
        bind_addr: addr.clone(),
        input_directory: Some(frames.clone()),
        frame_rate: 50.0,
        runtime: Duration::from_millis(400),
        start_delay: Duration::from_millis(500),
        report_frequency: 5,
        codec: CodecKind::Lz4,
        ..SimulatorConfig::default()
    };
    let mut simulator = FrameSimulator::new(sim_config, records)
        .expect("simulator")
        .spawn()
        .expect("spawn simulator");

    let config = PipelineConfig {
        channel: "e2e".into(),
        server_addr: addr,
        mbsz: 4,
        psz: 7,
        workers: 2,
        min_intensity: 100.0,
        idle_interval: Duration::from_secs(1),
        model: Default::default(),
        archive: Some(ArchiveSettings {
            path: archive_path.clone(),
            compression: false,
        }),
        ..PipelineConfig::default()
    };
    config.validate().expect("valid config");

    let model = load_model(ModelBackend::Centroid, None, config.mbsz, config.psz).expect("model");
    let extractor: Arc<dyn PatchExtractor> = Arc::new(PeakPatchExtractor::default());
    let mut fanout = FanOut::new();
    fanout.push(AsyncWriter::spawn(ArchiveWriter::new(&archive_path, false)).expect("archive"));
    let (_interrupt_tx, interrupt_rx) = bounded(1);

    let summary = run_pipeline(&config, model, extractor, fanout, interrupt_rx).expect("pipeline");
    let sim_summary = simulator.wait().expect("simulator");
    server.stop().expect("server stop");

    assert_eq!(summary.reason, "idle");
    assert_eq!(summary.unprocessed, 0);
    assert!(sim_summary.published >= 15, "published {}", sim_summary.published);
    assert_eq!(summary.received, sim_summary.published);
    assert_eq!(summary.missing, 0);
    assert_eq!(summary.stats.decode_failures, 0);
    assert_eq!(summary.stats.patches_extracted, 4 * summary.received);
    assert_eq!(summary.stats.big_peaks, 0);
    assert_eq!(summary.inferred_batches, summary.received);
    assert_eq!(summary.stats.results, summary.received);
    assert_eq!(summary.carryover_discarded, 0);
    assert_eq!(summary.sinks.len(), 1);
    assert_eq!(summary.sinks[0].written, summary.received);
    assert_eq!(summary.sinks[0].failed, 0);

    let archive = DatasetArchive::open(&archive_path).expect("open archive");
    let rows = 4 * summary.received as usize;
    assert_eq!(archive.shape("patches").unwrap(), Some(vec![rows, 7, 7]));
    assert_eq!(archive.shape("ploc").unwrap(), Some(vec![rows, 5]));
    assert_eq!(archive.shape("frame_id").unwrap(), Some(vec![rows]));

    let mut ids = archive.read_i64("frame_id").expect("frame ids");
    ids.sort_unstable();
    ids.dedup();
    let expected: Vec<i64> = (1..=summary.received as i64).collect();
    assert_eq!(ids, expected);

    // Peaks are symmetric, so every refined location is the peak pixel itself.
    let ploc = archive.read_f32("ploc").expect("ploc");
    for row in ploc.chunks(5) {
        let (fy, fx) = (row[1] + row[3], row[2] + row[4]);
        assert!(
            PEAKS
                .iter()
                .any(|(py, px)| (fy - *py as f32).abs() < 1e-3 && (fx - *px as f32).abs() < 1e-3),
            "unexpected refined location ({}, {})",
            fy,
            fx
        );
    }
}

#[test]
fn interrupt_stops_a_pipeline_with_no_producer_traffic() {
    let server = Arc::new(ChannelServer::bind("127.0.0.1:0").expect("bind"));
    server
        .add_record("quiet", Default::default())
        .expect("add record");
    let config = PipelineConfig {
        channel: "quiet".into(),
        server_addr: server.local_addr().to_string(),
        mbsz: 2,
        psz: 5,
        idle_interval: Duration::from_secs(600),
        archive: None,
        ..PipelineConfig::default()
    };
    let model = load_model(ModelBackend::Stub, None, config.mbsz, config.psz).expect("model");
    let (interrupt_tx, interrupt_rx) = bounded(1);
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        interrupt_tx.send(()).expect("interrupt");
    });

    let summary = run_pipeline(
        &config,
        model,
        Arc::new(PeakPatchExtractor::default()),
        FanOut::new(),
        interrupt_rx,
    )
    .expect("pipeline");
    trigger.join().expect("trigger");
    server.stop().expect("server stop");

    assert_eq!(summary.reason, "interrupt");
    assert_eq!(summary.received, 0);
    assert!(summary.sinks.is_empty());
}

#[test]
fn interrupt_during_traffic_accounts_for_every_received_frame() {
    let server = Arc::new(ChannelServer::bind("127.0.0.1:0").expect("bind"));
    server
        .add_record("busy", Default::default())
        .expect("add record");
    let publishing = Arc::new(AtomicBool::new(true));
    let publisher = {
        let server = server.clone();
        let publishing = publishing.clone();
        std::thread::spawn(move || {
            let mut id = 0i64;
            while publishing.load(Ordering::SeqCst) {
                id += 1;
                let pixels = PixelBuffer::U16(vec![(id % 200) as u16; 32 * 32]);
                server
                    .update("busy", NdArrayRecord::image(id, 32, 32, pixels))
                    .expect("update");
                std::thread::sleep(Duration::from_millis(1));
            }
            id
        })
    };

    let config = PipelineConfig {
        channel: "busy".into(),
        server_addr: server.local_addr().to_string(),
        mbsz: 2,
        psz: 5,
        workers: 1,
        idle_interval: Duration::from_secs(600),
        archive: None,
        ..PipelineConfig::default()
    };
    let model = load_model(ModelBackend::Stub, None, config.mbsz, config.psz).expect("model");
    let (interrupt_tx, interrupt_rx) = bounded(1);
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(400));
        interrupt_tx.send(()).expect("interrupt");
    });

    let summary = run_pipeline(
        &config,
        model,
        Arc::new(PeakPatchExtractor::default()),
        FanOut::new(),
        interrupt_rx,
    )
    .expect("pipeline");
    publishing.store(false, Ordering::SeqCst);
    let published = publisher.join().expect("publisher");
    trigger.join().expect("trigger");
    server.stop().expect("server stop");

    assert_eq!(summary.reason, "interrupt");
    assert!(summary.received > 0);
    assert!(summary.received <= published as u64);
    assert_eq!(summary.stats.decode_failures, 0);
    assert_eq!(
        summary.received,
        summary.stats.frames_decoded + summary.unprocessed
    );
}
