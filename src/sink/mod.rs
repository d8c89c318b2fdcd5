//! Result fan-out writers.
//!
//! Every sink runs its own `AsyncWriter` thread over a private unbounded
//! queue. `submit` copies what the sink needs out of the result on the
//! caller's thread and never blocks, so a stalled sink only delays itself.

pub mod archive;
pub mod broadcast;
pub mod live;

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;

use crate::frame::RefinedResult;

pub use archive::{ArchiveBlock, ArchiveWriter, DatasetArchive};
pub use broadcast::{BroadcastTransport, BroadcastWriter, MqttTransport};
pub use live::{LivePatch, LiveRepublisher};

/// One downstream consumer, driven by an `AsyncWriter`.
pub trait SinkWriter: Send + 'static {
    type Message: Send + 'static;

    fn name(&self) -> String;

    /// Copy what this sink needs out of a result. Runs on the producer's thread.
    fn prepare(result: &RefinedResult) -> Vec<Self::Message>;

    fn write(&mut self, message: Self::Message) -> Result<()>;

    /// Minimum time between the starts of two writes.
    fn min_interval(&self) -> Option<Duration> {
        None
    }

    /// Called once after the queue has drained.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WriterSummary {
    pub name: String,
    pub written: u64,
    pub failed: u64,
}

/// Object-safe face of a running writer, as held by the fan-out.
pub trait ResultSink: Send {
    fn name(&self) -> &str;

    fn submit(&self, result: &RefinedResult) -> Result<()>;

    /// Messages queued but not yet written.
    fn pending(&self) -> usize;

    /// Drain the queue, stop the thread and report.
    fn close(self: Box<Self>) -> Result<WriterSummary>;
}

pub struct AsyncWriter<W: SinkWriter> {
    name: String,
    queue: Sender<W::Message>,
    join: JoinHandle<WriterSummary>,
}

impl<W: SinkWriter> AsyncWriter<W> {
    pub fn spawn(mut writer: W) -> Result<Self> {
        let name = writer.name();
        let (queue, rx) = unbounded::<W::Message>();
        let thread_name = name.clone();
        let join = std::thread::Builder::new()
            .name(format!("sink-{}", thread_name))
            .spawn(move || {
                log::info!("async writer to {} started", thread_name);
                let min_interval = writer.min_interval();
                let mut summary = WriterSummary {
                    name: thread_name.clone(),
                    ..WriterSummary::default()
                };
                for message in rx.iter() {
                    let tick = Instant::now();
                    match writer.write(message) {
                        Ok(()) => summary.written += 1,
                        Err(err) => {
                            summary.failed += 1;
                            log::error!("{}: write failed: {:#}", thread_name, err);
                        }
                    }
                    if let Some(min) = min_interval {
                        let rest = min.saturating_sub(tick.elapsed());
                        if !rest.is_zero() {
                            std::thread::sleep(rest);
                        }
                    }
                }
                if let Err(err) = writer.finish() {
                    log::error!("{}: finish failed: {:#}", thread_name, err);
                }
                log::info!(
                    "async writer to {} stopped: {} written, {} failed",
                    thread_name,
                    summary.written,
                    summary.failed
                );
                summary
            })?;
        Ok(Self { name, queue, join })
    }
}

impl<W: SinkWriter> ResultSink for AsyncWriter<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, result: &RefinedResult) -> Result<()> {
        for message in W::prepare(result) {
            self.queue
                .send(message)
                .map_err(|_| anyhow!("{} writer is gone", self.name))?;
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn close(self: Box<Self>) -> Result<WriterSummary> {
        let AsyncWriter { name, queue, join } = *self;
        drop(queue);
        join.join().map_err(|_| anyhow!("{} writer thread panicked", name))
    }
}

/// Set of sinks every refined result is handed to.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S: ResultSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand a result to every sink. Never blocks; a failing sink is logged and skipped.
    pub fn publish(&self, result: &RefinedResult) {
        for sink in &self.sinks {
            if let Err(err) = sink.submit(result) {
                log::warn!("result from frame {} not queued: {:#}", result.frame_id, err);
            } else {
                log::debug!("{}: {} messages pending", sink.name(), sink.pending());
            }
        }
    }

    pub fn pending(&self) -> Vec<(String, usize)> {
        self.sinks
            .iter()
            .map(|s| (s.name().to_string(), s.pending()))
            .collect()
    }

    /// Drain and stop every sink, in registration order.
    pub fn close(self) -> Vec<WriterSummary> {
        let mut summaries = Vec::with_capacity(self.sinks.len());
        for sink in self.sinks {
            let name = sink.name().to_string();
            match sink.close() {
                Ok(summary) => summaries.push(summary),
                Err(err) => log::error!("closing {} failed: {:#}", name, err),
            }
        }
        summaries
    }
}
