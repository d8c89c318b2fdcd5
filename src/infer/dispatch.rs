//! Inference dispatch thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{anyhow, Result};
use crossbeam_channel::Receiver;

use super::RefinementModel;
use crate::frame::{Batch, RefinedResult};
use crate::pipeline::PipelineStats;
use crate::sink::FanOut;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches: u64,
    pub patches: u64,
    pub failures: u64,
}

/// Owns the model and the fan-out; consumes batches until every producer is gone.
pub struct InferenceDispatch {
    join: JoinHandle<(FanOut, DispatchSummary)>,
}

impl InferenceDispatch {
    pub fn spawn(
        model: Box<dyn RefinementModel>,
        batches: Receiver<Batch>,
        fanout: FanOut,
        mbsz: usize,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let join = std::thread::Builder::new()
            .name("inference".into())
            .spawn(move || run_dispatch(model, batches, fanout, mbsz, &stats))?;
        Ok(Self { join })
    }

    /// Wait for the batch queue to disconnect and drain; hands the fan-out back.
    pub fn join(self) -> Result<(FanOut, DispatchSummary)> {
        self.join
            .join()
            .map_err(|_| anyhow!("inference thread panicked"))
    }
}

fn run_dispatch(
    mut model: Box<dyn RefinementModel>,
    batches: Receiver<Batch>,
    fanout: FanOut,
    mbsz: usize,
    stats: &PipelineStats,
) -> (FanOut, DispatchSummary) {
    let mut summary = DispatchSummary::default();
    for batch in batches.iter() {
        if batch.is_empty() {
            continue;
        }
        let patches = batch.len();
        let psz = batch.psz;
        let frame_id = batch.frame_id;

        let batch_tick = Instant::now();
        // undersized batches only come from a shutdown flush; pad for the model
        let input = batch.to_input(mbsz);
        let rows = input.len() / (psz * psz).max(1);
        let compute_tick = Instant::now();
        let corrections = match model.infer(&input, rows, psz) {
            Ok(mut corrections) => {
                corrections.truncate(patches);
                corrections
            }
            Err(err) => {
                summary.failures += 1;
                log::error!("inference failed on batch from frame {}: {:#}", frame_id, err);
                continue;
            }
        };
        let t_comp = compute_tick.elapsed().as_secs_f64() * 1000.0;

        let result = match RefinedResult::compose(batch, corrections) {
            Ok(result) => result,
            Err(err) => {
                summary.failures += 1;
                log::error!("batch from frame {} dropped: {:#}", frame_id, err);
                continue;
            }
        };
        fanout.publish(&result);
        summary.batches += 1;
        summary.patches += patches as u64;
        stats.add_result();

        log::info!(
            "a batch of {} patches infered in {:.3} ms (computing: {:.3} ms), {} batches pending infer",
            patches,
            batch_tick.elapsed().as_secs_f64() * 1000.0,
            t_comp,
            batches.len()
        );
    }
    log::info!(
        "inference stopped after {} batches ({} patches, {} failures)",
        summary.batches,
        summary.patches,
        summary.failures
    );
    (fanout, summary)
}
