//! Idle/liveness supervisor.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{never, Receiver, RecvTimeoutError, Sender};

use crate::frame::{Batch, WorkerMessage};
use crate::ingest::IngestStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No new frames and no pending work for a whole check interval.
    Idle,
    /// Operator requested stop.
    Interrupted,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Idle => f.write_str("idle"),
            ShutdownReason::Interrupted => f.write_str("interrupt"),
        }
    }
}

/// Pipeline liveness at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessSnapshot {
    pub received: u64,
    pub frames_pending: usize,
    pub batches_pending: usize,
}

/// Idle when nothing arrived since `received_before` and both queues are drained.
pub fn is_idle(received_before: u64, now: &LivenessSnapshot) -> bool {
    now.received == received_before && now.frames_pending == 0 && now.batches_pending == 0
}

pub struct IdleSupervisor {
    interval: Duration,
    workers: usize,
    frames: Sender<WorkerMessage>,
    batches: Receiver<Batch>,
    ingest: Arc<IngestStats>,
    interrupt: Receiver<()>,
}

impl IdleSupervisor {
    /// `batches` is only inspected for its depth, never consumed.
    pub fn new(
        interval: Duration,
        workers: usize,
        frames: Sender<WorkerMessage>,
        batches: Receiver<Batch>,
        ingest: Arc<IngestStats>,
        interrupt: Receiver<()>,
    ) -> Self {
        Self {
            interval,
            workers,
            frames,
            batches,
            ingest,
            interrupt,
        }
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        LivenessSnapshot {
            received: self.ingest.received(),
            frames_pending: self.frames.len(),
            batches_pending: self.batches.len(),
        }
    }

    /// Block until the pipeline is idle or interrupted, then send one
    /// shutdown sentinel per worker.
    pub fn run(mut self) -> ShutdownReason {
        log::info!(
            "idle supervisor checking every {:.1}s for {} worker(s)",
            self.interval.as_secs_f64(),
            self.workers
        );
        let reason = loop {
            let before = self.ingest.received();
            match self.interrupt.recv_timeout(self.interval) {
                Ok(()) => break ShutdownReason::Interrupted,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // no interrupt source left; keep the timer going
                    self.interrupt = never();
                    continue;
                }
            }
            let now = self.snapshot();
            if is_idle(before, &now) {
                break ShutdownReason::Idle;
            }
            log::debug!(
                "pipeline alive: {} frames received, {} frames and {} batches pending",
                now.received,
                now.frames_pending,
                now.batches_pending
            );
        };
        log::info!("program exits because of {}", reason);
        self.broadcast_shutdown();
        reason
    }

    fn broadcast_shutdown(&self) {
        for _ in 0..self.workers {
            if self.frames.send(WorkerMessage::Shutdown).is_err() {
                log::warn!("raw-frame queue closed before all shutdown sentinels were sent");
                break;
            }
        }
    }
}
