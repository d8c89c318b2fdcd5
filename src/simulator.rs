//! Frame source simulator.
//!
//! Publishes random or directory-replayed frames on a channel at a paced
//! rate. The schedule is anchored on the first publish: frame `n` is due at
//! `start + n * period`, so late publishes are caught up rather than
//! accumulated as drift.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::channel::{Codec, NdArrayRecord, RecordServer};
use crate::codec::{self, CodecKind};
use crate::config::SimulatorConfig;
use crate::frame::PixelBuffer;

/// Subtracted from every computed delay to absorb scheduling overhead.
pub const DELAY_CORRECTION: Duration = Duration::from_micros(100);
pub const FRAME_DESCRIPTOR: &str = "Simulated Detector Image";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulatorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Pixels of one frame before it is stamped and published.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceFrame {
    pub rows: usize,
    pub cols: usize,
    pub pixels: PixelBuffer,
}

pub enum FrameSource {
    Random { nx: usize, ny: usize, rng: StdRng },
    Directory(DirectoryReplay),
}

impl FrameSource {
    pub fn from_config(config: &SimulatorConfig) -> Self {
        match &config.input_directory {
            Some(dir) => FrameSource::Directory(DirectoryReplay::new(dir)),
            None => FrameSource::random(config.nx, config.ny),
        }
    }

    pub fn random(nx: usize, ny: usize) -> Self {
        FrameSource::Random {
            nx,
            ny,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn next_frame(&mut self) -> Result<SourceFrame> {
        match self {
            FrameSource::Random { nx, ny, rng } => {
                let pixels = (0..*nx * *ny).map(|_| rng.gen_range(0..256i16)).collect();
                Ok(SourceFrame {
                    rows: *ny,
                    cols: *nx,
                    pixels: PixelBuffer::I16(pixels),
                })
            }
            FrameSource::Directory(replay) => replay.next_frame(),
        }
    }
}

/// Cycles over the image files of a directory in name order, rescanning it
/// whenever a pass is exhausted.
pub struct DirectoryReplay {
    dir: PathBuf,
    queue: VecDeque<PathBuf>,
    scanned: bool,
    loaded_this_pass: usize,
}

impl DirectoryReplay {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            queue: VecDeque::new(),
            scanned: false,
            loaded_this_pass: 0,
        }
    }

    fn rescan(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("cannot read input directory {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        log::debug!("{} files queued from {}", files.len(), self.dir.display());
        self.queue = files.into();
        self.scanned = true;
        self.loaded_this_pass = 0;
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<SourceFrame> {
        loop {
            if self.queue.is_empty() {
                if self.scanned && self.loaded_this_pass == 0 {
                    return Err(anyhow!(
                        "no image could be loaded from {}",
                        self.dir.display()
                    ));
                }
                self.rescan()?;
                if self.queue.is_empty() {
                    return Err(anyhow!("input directory {} is empty", self.dir.display()));
                }
            }
            let Some(path) = self.queue.pop_front() else {
                continue;
            };
            match load_image(&path) {
                Ok(frame) => {
                    self.loaded_this_pass += 1;
                    log::debug!("loaded {} ({}x{})", path.display(), frame.rows, frame.cols);
                    return Ok(frame);
                }
                Err(err) => log::warn!("skipping {}: {:#}", path.display(), err),
            }
        }
    }
}

fn load_image(path: &Path) -> Result<SourceFrame> {
    let image = image::open(path).with_context(|| format!("cannot decode {}", path.display()))?;
    let rows = image.height() as usize;
    let cols = image.width() as usize;
    let pixels = match image {
        DynamicImage::ImageLuma8(buf) => PixelBuffer::U8(buf.into_raw()),
        DynamicImage::ImageLuma16(buf) => PixelBuffer::U16(buf.into_raw()),
        other => {
            let color = other.color();
            match color.bytes_per_pixel() / color.channel_count().max(1) {
                1 => PixelBuffer::U8(other.to_luma8().into_raw()),
                2 => PixelBuffer::U16(other.to_luma16().into_raw()),
                _ => PixelBuffer::F32(other.to_luma32f().into_raw()),
            }
        }
    };
    Ok(SourceFrame { rows, cols, pixels })
}

/// Channel record for one frame. Compressed frames carry their bytes as an
/// unsigned-byte value and the element-type code in the codec parameter.
pub fn frame_record(id: i64, frame: &SourceFrame, codec: &CodecKind) -> Result<NdArrayRecord> {
    let mut record = NdArrayRecord::image(id, frame.rows, frame.cols, frame.pixels.clone())
        .with_descriptor(FRAME_DESCRIPTOR)
        .with_attribute("ColorMode", 0.0);
    if codec.is_compressed() {
        let raw = frame.pixels.to_le_bytes();
        let packed = codec::compress(codec, &raw)?;
        record.codec = Codec {
            name: codec.name().to_string(),
            parameters: frame.pixels.pixel_type().code(),
        };
        record.compressed_size = packed.len() as i64;
        record.uncompressed_size = raw.len() as i64;
        record.value = Some(PixelBuffer::U8(packed));
    }
    Ok(record)
}

/// Time to wait before publish number `published` (zero-based) is due.
/// `None` means the schedule is behind and the frame goes out immediately.
pub fn pacing_delay(
    start: Instant,
    published: u64,
    period: Duration,
    now: Instant,
) -> Option<Duration> {
    let due = start + period.mul_f64(published as f64);
    due.checked_duration_since(now)
        .and_then(|delay| delay.checked_sub(DELAY_CORRECTION))
        .filter(|delay| !delay.is_zero())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SimulatorSummary {
    pub published: u64,
    pub last_frame_id: i64,
    /// Seconds between the first and the last publish.
    pub runtime: f64,
    pub rate: f64,
}

/// Run statistics of one simulator instance.
#[derive(Debug, Default)]
struct RunStats {
    published: u64,
    last_frame_id: i64,
    start: Option<Instant>,
    last_publish: Option<Instant>,
}

impl RunStats {
    fn record(&mut self, frame_id: i64, at: Instant) {
        self.published += 1;
        self.last_frame_id = frame_id;
        self.start.get_or_insert(at);
        self.last_publish = Some(at);
    }

    fn runtime(&self) -> Duration {
        match (self.start, self.last_publish) {
            (Some(start), Some(last)) => last.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    fn rate(&self) -> f64 {
        let runtime = self.runtime().as_secs_f64();
        if self.published > 1 && runtime > 0.0 {
            (self.published - 1) as f64 / runtime
        } else {
            0.0
        }
    }

    fn summary(&self) -> SimulatorSummary {
        SimulatorSummary {
            published: self.published,
            last_frame_id: self.last_frame_id,
            runtime: self.runtime().as_secs_f64(),
            rate: self.rate(),
        }
    }
}

pub struct FrameSimulator {
    config: SimulatorConfig,
    server: Arc<dyn RecordServer>,
    source: FrameSource,
    state: Arc<Mutex<SimulatorState>>,
    stats: RunStats,
}

impl FrameSimulator {
    pub fn new(config: SimulatorConfig, server: Arc<dyn RecordServer>) -> Result<Self> {
        config.validate()?;
        let source = FrameSource::from_config(&config);
        Ok(Self {
            config,
            server,
            source,
            state: Arc::new(Mutex::new(SimulatorState::Idle)),
            stats: RunStats::default(),
        })
    }

    /// Replace the frame source, e.g. with a seeded one.
    pub fn with_source(mut self, source: FrameSource) -> Self {
        self.source = source;
        self
    }

    pub fn state(&self) -> SimulatorState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(SimulatorState::Stopped)
    }

    fn set_state(&self, next: SimulatorState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Publish until the runtime is reached, the source fails fatally, or
    /// `stop` fires or disconnects.
    pub fn run(mut self, stop: Receiver<()>) -> Result<SimulatorSummary> {
        self.server
            .add_record(&self.config.channel, NdArrayRecord::default())?;
        log::info!(
            "serving {} on channel '{}' ({} fps, runtime {:.1} s)",
            match &self.config.input_directory {
                Some(dir) => format!("images from {}", dir.display()),
                None => format!("random {}x{} frames", self.config.nx, self.config.ny),
            },
            self.config.channel,
            self.config.frame_rate,
            self.config.runtime.as_secs_f64()
        );

        let outcome = self.publish_loop(&stop);
        self.set_state(SimulatorState::Stopped);

        let summary = self.stats.summary();
        log::info!("Server runtime: {:.4} seconds", summary.runtime);
        log::info!(
            "Published frames: {:6} @ {:.4} fps",
            summary.published,
            summary.rate
        );
        outcome.map(|()| summary)
    }

    fn publish_loop(&mut self, stop: &Receiver<()>) -> Result<()> {
        if wait_or_stop(stop, self.config.start_delay) {
            return Ok(());
        }
        self.set_state(SimulatorState::Running);
        let period = self.config.period();
        let mut next_id: i64 = 1;

        loop {
            if !matches!(stop.try_recv(), Err(crossbeam_channel::TryRecvError::Empty)) {
                self.set_state(SimulatorState::Draining);
                return Ok(());
            }

            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    log::error!("frame source failed: {:#}", err);
                    return Err(err);
                }
            };
            let record = frame_record(next_id, &frame, &self.config.codec)?;
            self.server.update(&self.config.channel, record)?;
            let published_at = Instant::now();
            self.stats.record(next_id, published_at);
            next_id += 1;

            let frequency = self.config.report_frequency;
            if frequency > 0 && self.stats.published % frequency == 0 {
                log::info!(
                    "Published frame id {:6} @ {:.3} (frame rate: {:.4} fps)",
                    self.stats.last_frame_id,
                    crate::channel::TimeStamp::now().as_secs_f64(),
                    self.stats.rate()
                );
            }

            if self.stats.runtime() > self.config.runtime {
                log::info!(
                    "Server will exit after reaching runtime of {:.1} seconds",
                    self.config.runtime.as_secs_f64()
                );
                self.set_state(SimulatorState::Draining);
                return Ok(());
            }

            if let (Some(period), Some(start)) = (period, self.stats.start) {
                if let Some(delay) =
                    pacing_delay(start, self.stats.published, period, Instant::now())
                {
                    if wait_or_stop(stop, delay) {
                        self.set_state(SimulatorState::Draining);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run on a background thread.
    pub fn spawn(self) -> Result<SimulatorHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let state = self.state.clone();
        let join = std::thread::Builder::new()
            .name("ad-sim".into())
            .spawn(move || self.run(stop_rx))?;
        Ok(SimulatorHandle {
            stop: Some(stop_tx),
            join: Some(join),
            state,
            outcome: None,
        })
    }
}

/// Sleep for `delay` unless a stop request arrives first. Returns true on stop.
fn wait_or_stop(stop: &Receiver<()>, delay: Duration) -> bool {
    if delay.is_zero() {
        return false;
    }
    match stop.recv_timeout(delay) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

pub struct SimulatorHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<Result<SimulatorSummary>>>,
    state: Arc<Mutex<SimulatorState>>,
    outcome: Option<std::result::Result<SimulatorSummary, String>>,
}

impl SimulatorHandle {
    pub fn state(&self) -> SimulatorState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(SimulatorState::Stopped)
    }

    /// Halt scheduling and collect the final summary. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<SimulatorSummary> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        self.wait()
    }

    /// Wait for the run to finish on its own.
    pub fn wait(&mut self) -> Result<SimulatorSummary> {
        if let Some(join) = self.join.take() {
            let outcome = match join.join() {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(err)) => Err(format!("{:#}", err)),
                Err(_) => Err("simulator thread panicked".to_string()),
            };
            self.outcome = Some(outcome);
        }
        match &self.outcome {
            Some(Ok(summary)) => Ok(summary.clone()),
            Some(Err(err)) => Err(anyhow!("{}", err)),
            None => Err(anyhow!("simulator was never started")),
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryRecordServer;
    use crate::ingest::unpack_record;

    #[test]
    fn pacing_catches_up_instead_of_drifting() {
        let start = Instant::now();
        let period = Duration::from_millis(50);

        let delay = pacing_delay(start, 1, period, start + Duration::from_millis(10)).unwrap();
        assert_eq!(delay, Duration::from_millis(40) - DELAY_CORRECTION);

        // Frame 3 is due at 150 ms; being at 170 ms means publish now.
        assert_eq!(pacing_delay(start, 3, period, start + Duration::from_millis(170)), None);
        assert_eq!(pacing_delay(start, 3, period, start + Duration::from_millis(150)), None);
    }

    #[test]
    fn random_frames_are_nx_by_ny() {
        let mut source = FrameSource::Random {
            nx: 8,
            ny: 4,
            rng: StdRng::seed_from_u64(7),
        };
        let frame = source.next_frame().unwrap();
        assert_eq!((frame.rows, frame.cols), (4, 8));
        match frame.pixels {
            PixelBuffer::I16(values) => {
                assert_eq!(values.len(), 32);
                assert!(values.iter().all(|v| (0..256).contains(v)));
            }
            other => panic!("unexpected buffer {:?}", other.pixel_type()),
        }
    }

    #[test]
    fn compressed_records_unpack_to_their_pixel_type() {
        let frame = SourceFrame {
            rows: 2,
            cols: 3,
            pixels: PixelBuffer::U16(vec![1, 2, 3, 4, 5, 6]),
        };
        let record = frame_record(9, &frame, &CodecKind::Lz4).unwrap();
        assert_eq!(record.codec.name, "lz4");
        assert_eq!(record.uncompressed_size, 12);
        assert_eq!(record.attribute("ColorMode"), Some(0.0));

        let unpacked = unpack_record(record).unwrap();
        assert_eq!(unpacked.id, 9);
        assert_eq!((unpacked.rows, unpacked.cols), (2, 3));
        assert_eq!(unpacked.uncompressed_size, 12);
        assert!(unpacked.codec.is_compressed());
    }

    #[test]
    fn stop_before_start_delay_publishes_nothing() {
        let server = Arc::new(InMemoryRecordServer::new());
        let config = SimulatorConfig {
            channel: "sim".into(),
            start_delay: Duration::from_secs(30),
            nx: 4,
            ny: 4,
            ..SimulatorConfig::default()
        };
        let mut handle = FrameSimulator::new(config, server.clone())
            .unwrap()
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let summary = handle.stop().unwrap();
        assert_eq!(summary.published, 0);
        assert_eq!(handle.state(), SimulatorState::Stopped);
        // Only the empty initial value.
        assert_eq!(server.len("sim"), 1);
        // Idempotent.
        assert_eq!(handle.stop().unwrap(), summary);
    }

    #[test]
    fn unpaced_run_stops_at_runtime() {
        let server = Arc::new(InMemoryRecordServer::new());
        let config = SimulatorConfig {
            channel: "sim".into(),
            start_delay: Duration::ZERO,
            frame_rate: 200.0,
            runtime: Duration::from_millis(200),
            nx: 4,
            ny: 4,
            report_frequency: 0,
            ..SimulatorConfig::default()
        };
        let (_stop_tx, stop_rx) = bounded(1);
        let summary = FrameSimulator::new(config, server.clone())
            .unwrap()
            .run(stop_rx)
            .unwrap();
        assert!(summary.published >= 40, "published {}", summary.published);
        assert_eq!(summary.last_frame_id, summary.published as i64);
        let history = server.history("sim");
        assert_eq!(history.len() as u64, summary.published + 1);
        assert_eq!(history[1].unique_id, 1);
    }
}
