//! Edge Bragg peak pipeline.
//!
//! Ingests area-detector frames from a streaming channel, crops patches around
//! intensity peaks, batches them for a peak-refinement model and fans the
//! refined results out to archive, broadcast and live sinks. A frame source
//! simulator drives the same channel protocol for end-to-end runs.
//!
//! # Module Structure
//!
//! - `channel`: record type, TCP channel server and monitor
//! - `codec`: payload compression (none, lz4)
//! - `frame`: pixel buffers, frames, patches, batches and results
//! - `ingest`: channel callback that enqueues frames for the workers
//! - `extract`: peak finding and patch cropping
//! - `pipeline`: worker pool, batching, idle supervisor and wiring
//! - `infer`: refinement models and the inference dispatch thread
//! - `sink`: result fan-out and its writers
//! - `simulator`: paced frame source
//! - `config`: file + environment configuration
//! - `ui`: startup stage reporting for the binaries

pub mod channel;
pub mod codec;
pub mod config;
pub mod extract;
pub mod frame;
pub mod infer;
pub mod ingest;
pub mod pipeline;
pub mod simulator;
pub mod sink;
pub mod ui;

pub use channel::{ChannelMonitor, ChannelServer, InMemoryRecordServer, NdArrayRecord, RecordServer};
pub use codec::{CodecAdapter, CodecKind};
pub use config::{PipelineConfig, SimulatorConfig};
pub use extract::{Extraction, PatchExtractor, PeakPatchExtractor};
pub use frame::{Batch, Frame, Patch, PatchOrigin, PixelBuffer, PixelType, RawFrame, RefinedResult, WorkerMessage};
pub use infer::{load_model, ModelBackend, RefinementModel};
pub use ingest::{IngestClient, IngestStats};
pub use pipeline::{run_pipeline, PipelineStats, RunSummary, ShutdownReason};
pub use simulator::{FrameSimulator, SimulatorHandle, SimulatorSummary};
pub use sink::{AsyncWriter, FanOut, ResultSink, SinkWriter, WriterSummary};
