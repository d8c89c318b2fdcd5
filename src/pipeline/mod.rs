//! Pipeline wiring: ingest, worker pool, inference dispatch and the idle
//! supervisor, connected by unbounded queues.
//!
//! ```text
//! monitor -> IngestClient -> frames -> workers -> batches -> dispatch -> FanOut
//!                                                               ^
//!                         IdleSupervisor (depth only) ----------'
//! ```

pub mod batcher;
pub mod supervisor;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver};
use serde::Serialize;

use crate::channel::ChannelMonitor;
use crate::config::PipelineConfig;
use crate::extract::{Extraction, PatchExtractor};
use crate::frame::{Batch, WorkerMessage};
use crate::infer::{DispatchSummary, InferenceDispatch, RefinementModel};
use crate::ingest::{IngestClient, IngestStats};
use crate::sink::{FanOut, WriterSummary};

pub use batcher::BatchAccumulator;
pub use supervisor::{IdleSupervisor, LivenessSnapshot, ShutdownReason};
pub use worker::{spawn_workers, WorkerContext, WorkerSettings, WorkerSummary};

/// Counters shared by the workers and the dispatch thread.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_decoded: AtomicU64,
    decode_failures: AtomicU64,
    patches_extracted: AtomicU64,
    big_peaks: AtomicU64,
    small_peaks: AtomicU64,
    edge_peaks: AtomicU64,
    batches: AtomicU64,
    results: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub patches_extracted: u64,
    pub big_peaks: u64,
    pub small_peaks: u64,
    pub edge_peaks: u64,
    pub batches: u64,
    pub results: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_decoded_frame(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extraction(&self, extraction: &Extraction) {
        self.patches_extracted
            .fetch_add(extraction.len() as u64, Ordering::Relaxed);
        self.big_peaks
            .fetch_add(extraction.big_peaks as u64, Ordering::Relaxed);
        self.small_peaks
            .fetch_add(extraction.small_peaks as u64, Ordering::Relaxed);
        self.edge_peaks
            .fetch_add(extraction.edge_peaks as u64, Ordering::Relaxed);
    }

    pub fn add_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_result(&self) {
        self.results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            patches_extracted: self.patches_extracted.load(Ordering::Relaxed),
            big_peaks: self.big_peaks.load(Ordering::Relaxed),
            small_peaks: self.small_peaks.load(Ordering::Relaxed),
            edge_peaks: self.edge_peaks.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            results: self.results.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub reason: String,
    pub received: u64,
    pub expected: u64,
    pub missing: u64,
    /// Frames still queued behind the shutdown sentinels, never decoded.
    pub unprocessed: u64,
    pub elapsed_secs: f64,
    pub stats: PipelineSnapshot,
    pub carryover_discarded: usize,
    pub carryover_flushed: usize,
    pub inferred_batches: u64,
    pub inferred_patches: u64,
    pub inference_failures: u64,
    pub sinks: Vec<WriterSummary>,
}

impl RunSummary {
    fn new(
        reason: ShutdownReason,
        ingest: &IngestStats,
        unprocessed: u64,
        elapsed_secs: f64,
        stats: PipelineSnapshot,
        workers: &[WorkerSummary],
        dispatch: DispatchSummary,
        sinks: Vec<WriterSummary>,
    ) -> Self {
        Self {
            reason: reason.to_string(),
            received: ingest.received(),
            expected: ingest.expected(),
            missing: ingest.missing(),
            unprocessed,
            elapsed_secs,
            stats,
            carryover_discarded: workers.iter().map(|w| w.discarded).sum(),
            carryover_flushed: workers.iter().map(|w| w.flushed).sum(),
            inferred_batches: dispatch.batches,
            inferred_patches: dispatch.patches,
            inference_failures: dispatch.failures,
            sinks,
        }
    }
}

/// Run the pipeline against the channel named in `config` until it goes
/// idle or `interrupt` fires, then drain every stage and the sinks.
pub fn run_pipeline(
    config: &PipelineConfig,
    model: Box<dyn RefinementModel>,
    extractor: Arc<dyn PatchExtractor>,
    fanout: FanOut,
    interrupt: Receiver<()>,
) -> Result<RunSummary> {
    let started = Instant::now();
    let stats = Arc::new(PipelineStats::new());
    let ingest_stats = Arc::new(IngestStats::new());

    let (frames_tx, frames_rx) = unbounded::<WorkerMessage>();
    let (batches_tx, batches_rx) = unbounded::<Batch>();

    let dispatch = InferenceDispatch::spawn(
        model,
        batches_rx.clone(),
        fanout,
        config.mbsz,
        stats.clone(),
    )?;

    let leftover = frames_rx.clone();
    let ctx = WorkerContext {
        frames: frames_rx,
        batches: batches_tx,
        extractor,
        settings: WorkerSettings {
            mbsz: config.mbsz,
            psz: config.psz,
            min_intensity: config.min_intensity,
            flush_on_shutdown: config.flush_on_shutdown,
            high_watermark: config.high_watermark,
        },
        stats: stats.clone(),
    };
    let workers = spawn_workers(config.workers, &ctx)?;
    // Workers own the only batch senders from here on.
    drop(ctx);
    log::info!(
        "{} workers started (mbsz={}, psz={}, min_intensity={})",
        config.workers,
        config.mbsz,
        config.psz,
        config.min_intensity
    );

    let mut monitor =
        ChannelMonitor::connect_with_retry(&config.server_addr, &config.channel, config.connect_timeout)?;
    let mut client = IngestClient::new(frames_tx.clone(), ingest_stats.clone())
        .with_high_watermark(config.high_watermark);
    monitor.start(move |record| {
        if let Err(err) = client.on_record(record) {
            log::error!("record dropped at ingest: {:#}", err);
        }
    })?;
    log::info!(
        "monitoring channel '{}' on {}",
        config.channel,
        config.server_addr
    );

    let supervisor = IdleSupervisor::new(
        config.idle_interval,
        config.workers,
        frames_tx,
        batches_rx,
        ingest_stats.clone(),
        interrupt,
    );
    let reason = supervisor.run();
    log::info!("shutting down on {}", reason);

    match monitor.stop() {
        Ok(delivered) => log::debug!("monitor delivered {} records", delivered),
        Err(err) => log::error!("failed to stop channel monitor: {:#}", err),
    }
    drop(monitor);

    let mut worker_summaries = Vec::with_capacity(workers.len());
    for (index, handle) in workers.into_iter().enumerate() {
        match handle.join() {
            Ok(summary) => worker_summaries.push(summary),
            Err(_) => log::error!("worker {} panicked", index),
        }
    }
    let unprocessed = leftover
        .try_iter()
        .filter(|message| matches!(message, WorkerMessage::Frame(_)))
        .count() as u64;
    drop(leftover);
    if unprocessed > 0 {
        log::warn!("{} frames arrived after shutdown began and were not decoded", unprocessed);
    }

    let (fanout, dispatch_summary) = dispatch.join()?;
    let pending: usize = fanout.pending().iter().map(|(_, n)| n).sum();
    if pending > 0 {
        log::info!("draining {} queued sink writes", pending);
    }
    let sinks = fanout.close();

    let summary = RunSummary::new(
        reason,
        &ingest_stats,
        unprocessed,
        started.elapsed().as_secs_f64(),
        stats.snapshot(),
        &worker_summaries,
        dispatch_summary,
        sinks,
    );
    log::info!(
        "run finished ({}): {} frames received of {} expected ({} undecoded), {} patches, {} batches inferred, {} results in {:.1} s",
        summary.reason,
        summary.received,
        summary.expected,
        summary.unprocessed,
        summary.stats.patches_extracted,
        summary.inferred_batches,
        summary.stats.results,
        summary.elapsed_secs
    );
    if worker_summaries.len() != config.workers {
        return Err(anyhow!(
            "{} of {} workers did not exit cleanly",
            config.workers - worker_summaries.len(),
            config.workers
        ));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.add_decoded_frame();
        stats.add_decoded_frame();
        stats.add_decode_failure();
        stats.record_extraction(&Extraction {
            patches: Vec::new(),
            big_peaks: 2,
            small_peaks: 3,
            edge_peaks: 1,
        });
        stats.add_batch();
        stats.add_result();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_decoded, 2);
        assert_eq!(snap.decode_failures, 1);
        assert_eq!(snap.patches_extracted, 0);
        assert_eq!((snap.big_peaks, snap.small_peaks, snap.edge_peaks), (2, 3, 1));
        assert_eq!((snap.batches, snap.results), (1, 1));
    }
}
