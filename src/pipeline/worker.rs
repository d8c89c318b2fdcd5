//! Decode/extract worker pool.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};

use super::batcher::BatchAccumulator;
use super::PipelineStats;
use crate::codec::CodecAdapter;
use crate::extract::PatchExtractor;
use crate::frame::{Batch, Frame, PixelBuffer, RawFrame, WorkerMessage};

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub mbsz: usize,
    pub psz: usize,
    pub min_intensity: f32,
    /// Hand the undersized carryover to inference on shutdown instead of dropping it.
    pub flush_on_shutdown: bool,
    pub high_watermark: Option<usize>,
}

/// Everything a worker needs. Cloned once per worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub frames: Receiver<WorkerMessage>,
    pub batches: Sender<Batch>,
    pub extractor: Arc<dyn PatchExtractor>,
    pub settings: WorkerSettings,
    pub stats: Arc<PipelineStats>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub frames: u64,
    pub batches: u64,
    /// Carryover patches dropped at shutdown.
    pub discarded: usize,
    /// Carryover patches sent as an undersized batch at shutdown.
    pub flushed: usize,
}

pub fn spawn_workers(count: usize, ctx: &WorkerContext) -> Result<Vec<JoinHandle<WorkerSummary>>> {
    (0..count)
        .map(|index| {
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name(format!("frame-worker-{}", index))
                .spawn(move || run_worker(index, ctx))
                .map_err(|e| anyhow!("failed to spawn worker {}: {}", index, e))
        })
        .collect()
}

/// Worker loop: runs until a shutdown sentinel arrives or the queue closes.
pub fn run_worker(index: usize, ctx: WorkerContext) -> WorkerSummary {
    log::info!("worker {} starting", index);
    let settings = &ctx.settings;
    let mut codec = CodecAdapter::new();
    let mut acc = BatchAccumulator::new(settings.mbsz, settings.psz);
    let mut summary = WorkerSummary::default();

    loop {
        let frame = match ctx.frames.recv() {
            Ok(WorkerMessage::Frame(frame)) => frame,
            Ok(WorkerMessage::Shutdown) => break,
            Err(_) => {
                log::warn!("worker {}: raw-frame queue closed without sentinel", index);
                break;
            }
        };
        let frame_id = frame.id;

        let raw = match decode_frame(&mut codec, frame, &ctx.stats) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("worker {}: frame {} dropped: {:#}", index, frame_id, err);
                continue;
            }
        };
        summary.frames += 1;

        let tick = Instant::now();
        let extraction = match ctx
            .extractor
            .extract(&raw, settings.psz, settings.min_intensity)
        {
            Ok(extraction) => extraction,
            Err(err) => {
                log::error!("worker {}: extraction failed on frame {}: {:#}", index, frame_id, err);
                continue;
            }
        };
        let found = extraction.len();
        ctx.stats.record_extraction(&extraction);

        for batch in acc.push_frame(frame_id, extraction.patches) {
            if ctx.batches.send(batch).is_err() {
                log::error!("worker {}: batch queue closed, stopping", index);
                return summary;
            }
            summary.batches += 1;
            ctx.stats.add_batch();
        }

        let pending = ctx.batches.len();
        log::info!(
            "{} patches cropped from frame {}, {:.3}ms/frame, {} peaks are too big; {} patches pending infer",
            found,
            frame_id,
            tick.elapsed().as_secs_f64() * 1000.0,
            extraction.big_peaks,
            settings.mbsz * pending
        );
        if let Some(limit) = settings.high_watermark {
            if pending > limit {
                log::warn!("batch queue depth {} exceeds high watermark {}", pending, limit);
            }
        }
    }

    if settings.flush_on_shutdown {
        if let Some(batch) = acc.flush() {
            summary.flushed = batch.len();
            if ctx.batches.send(batch).is_ok() {
                ctx.stats.add_batch();
                summary.batches += 1;
            }
        }
    } else {
        summary.discarded = acc.discard();
    }
    if summary.discarded > 0 {
        log::info!(
            "worker {}: {} carryover patches discarded at shutdown",
            index,
            summary.discarded
        );
    }
    log::info!(
        "worker {} exiting after {} frames, {} batches",
        index,
        summary.frames,
        summary.batches
    );
    summary
}

/// Decompress a frame, falling back to its payload as raw pixels.
pub fn decode_frame(codec: &mut CodecAdapter, frame: Frame, stats: &PipelineStats) -> Result<RawFrame> {
    let tick = Instant::now();
    let bytes = match codec.decompress(
        &frame.payload,
        &frame.codec,
        frame.compressed_size,
        frame.uncompressed_size,
    ) {
        Ok(()) => {
            log::info!(
                "frame {} has been decoded in {:.2} ms, compress ratio is {:.1}",
                frame.id,
                tick.elapsed().as_secs_f64() * 1000.0,
                codec.compress_ratio()
            );
            codec.take_data()
        }
        Err(err) => {
            if frame.codec.is_compressed() {
                stats.add_decode_failure();
                log::warn!("frame {} decode failed, using payload as raw: {:#}", frame.id, err);
            } else {
                log::debug!("frame {}: {}", frame.id, err);
            }
            frame.payload
        }
    };
    let pixels = PixelBuffer::from_le_bytes(frame.pixel_type, &bytes)?;
    let raw = RawFrame::new(frame.id, frame.rows, frame.cols, pixels)?;
    stats.add_decoded_frame();
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TimeStamp;
    use crate::codec::{compress, CodecKind};
    use crate::extract::Extraction;
    use crate::frame::{Patch, PatchOrigin, PixelType};
    use crossbeam_channel::unbounded;

    /// Emits `n` patches per frame regardless of content.
    struct FixedExtractor(usize);

    impl PatchExtractor for FixedExtractor {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn extract(&self, frame: &RawFrame, psz: usize, _min: f32) -> Result<Extraction> {
            Ok(Extraction {
                patches: (0..self.0)
                    .map(|i| Patch {
                        pixels: vec![0.0; psz * psz],
                        origin: PatchOrigin {
                            frame_id: frame.id,
                            row_offset: i,
                            col_offset: 0,
                            peak_row: i,
                            peak_col: 0,
                        },
                    })
                    .collect(),
                ..Extraction::default()
            })
        }
    }

    fn frame(id: i64) -> Frame {
        let payload = PixelBuffer::U16(vec![1; 16]).to_le_bytes();
        Frame {
            id,
            rows: 4,
            cols: 4,
            pixel_type: PixelType::U16,
            compressed_size: payload.len(),
            uncompressed_size: payload.len(),
            payload,
            codec: CodecKind::None,
            timestamp: TimeStamp::default(),
        }
    }

    fn context(
        per_frame: usize,
        flush: bool,
    ) -> (WorkerContext, Sender<WorkerMessage>, Receiver<Batch>) {
        let (frame_tx, frame_rx) = unbounded();
        let (batch_tx, batch_rx) = unbounded();
        let ctx = WorkerContext {
            frames: frame_rx,
            batches: batch_tx,
            extractor: Arc::new(FixedExtractor(per_frame)),
            settings: WorkerSettings {
                mbsz: 4,
                psz: 3,
                min_intensity: 100.0,
                flush_on_shutdown: flush,
                high_watermark: None,
            },
            stats: Arc::new(PipelineStats::default()),
        };
        (ctx, frame_tx, batch_rx)
    }

    #[test]
    fn one_frame_of_ten_patches_yields_two_batches_and_drops_carryover() {
        let (ctx, frames, batches) = context(10, false);
        let stats = ctx.stats.clone();
        frames.send(WorkerMessage::Frame(frame(1))).unwrap();
        frames.send(WorkerMessage::Shutdown).unwrap();

        let summary = run_worker(0, ctx);
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.discarded, 2);
        let emitted: Vec<Batch> = batches.try_iter().collect();
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|b| b.len() == 4));
        assert_eq!(stats.snapshot().patches_extracted, 10);
    }

    #[test]
    fn flush_on_shutdown_sends_the_partial_batch() {
        let (ctx, frames, batches) = context(6, true);
        frames.send(WorkerMessage::Frame(frame(1))).unwrap();
        frames.send(WorkerMessage::Shutdown).unwrap();

        let summary = run_worker(0, ctx);
        assert_eq!(summary.flushed, 2);
        let sizes: Vec<usize> = batches.try_iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 2]);
    }

    #[test]
    fn corrupt_payload_falls_back_to_raw_bytes() {
        let stats = PipelineStats::default();
        let mut codec = CodecAdapter::new();
        let mut bad = frame(2);
        bad.codec = CodecKind::Lz4;
        let raw = decode_frame(&mut codec, bad, &stats).unwrap();
        assert_eq!(raw.value(3, 3), 1.0);
        assert_eq!(stats.snapshot().decode_failures, 1);

        let mut good = frame(3);
        let packed = compress(&CodecKind::Lz4, &good.payload).unwrap();
        good.compressed_size = packed.len();
        good.payload = packed;
        good.codec = CodecKind::Lz4;
        let raw = decode_frame(&mut codec, good, &stats).unwrap();
        assert_eq!(raw.rows, 4);
        assert!(codec.compress_ratio() > 1.0);
    }
}
