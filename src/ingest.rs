//! Frame ingest client.
//!
//! Invoked from the channel monitor's reader thread for every record. It only
//! unpacks protocol metadata and enqueues; decoding happens in the workers.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;

use crate::channel::NdArrayRecord;
use crate::codec::CodecKind;
use crate::frame::{Frame, PixelType, WorkerMessage};

/// Counters shared with the idle supervisor.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    expected: AtomicU64,
    last_id: AtomicI64,
    warmed_up: AtomicBool,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames enqueued, excluding the warm-up record.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Frames the producer has sent since the first real one, by id.
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::SeqCst)
    }

    pub fn last_id(&self) -> i64 {
        self.last_id.load(Ordering::SeqCst)
    }

    pub fn warmed_up(&self) -> bool {
        self.warmed_up.load(Ordering::SeqCst)
    }

    /// Frames lost in transport so far.
    pub fn missing(&self) -> u64 {
        self.expected().saturating_sub(self.received())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First record of the subscription, dropped.
    WarmUp,
    Queued { id: i64, depth: usize },
}

pub struct IngestClient {
    frames: Sender<WorkerMessage>,
    stats: Arc<IngestStats>,
    first_id: Option<i64>,
    high_watermark: Option<usize>,
}

impl IngestClient {
    pub fn new(frames: Sender<WorkerMessage>, stats: Arc<IngestStats>) -> Self {
        Self {
            frames,
            stats,
            first_id: None,
            high_watermark: None,
        }
    }

    pub fn with_high_watermark(mut self, high_watermark: Option<usize>) -> Self {
        self.high_watermark = high_watermark;
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Handle one record from the subscription.
    pub fn on_record(&mut self, record: NdArrayRecord) -> Result<IngestOutcome> {
        if !self.stats.warmed_up.swap(true, Ordering::SeqCst) {
            log::info!("discarding warm-up record (uniqueId {})", record.unique_id);
            return Ok(IngestOutcome::WarmUp);
        }

        let frame = unpack_record(record)?;
        let id = frame.id;
        let first_id = *self.first_id.get_or_insert(id);
        let previous = self.stats.last_id.swap(id, Ordering::SeqCst);

        self.frames
            .send(WorkerMessage::Frame(frame))
            .map_err(|_| anyhow!("raw-frame queue closed, dropping frame {}", id))?;

        let received = self.stats.received.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = (id - first_id + 1).max(0) as u64;
        self.stats.expected.fetch_max(expected, Ordering::SeqCst);
        let depth = self.frames.len();

        log::info!(
            "received frame {}, received: {}, expected: {}, frames pending decode: {}",
            id,
            received,
            expected,
            depth
        );
        if received > 1 && id > previous + 1 {
            log::warn!(
                "gap before frame {}: {} frame(s) missing ({} lost so far)",
                id,
                id - previous - 1,
                self.stats.missing()
            );
        }
        if let Some(limit) = self.high_watermark {
            if depth > limit {
                log::warn!("raw-frame queue depth {} exceeds high watermark {}", depth, limit);
            }
        }
        Ok(IngestOutcome::Queued { id, depth })
    }
}

/// Unpack a channel record into a `Frame`.
///
/// Uncompressed records carry typed pixels; compressed ones carry the payload
/// as bytes and name the element type in the codec parameter.
pub fn unpack_record(record: NdArrayRecord) -> Result<Frame> {
    let id = record.unique_id;
    let (cols, rows) = match (record.cols(), record.rows()) {
        (Some(cols), Some(rows)) => (cols, rows),
        _ => return Err(anyhow!("record {} is not two-dimensional", id)),
    };
    let value = record
        .value
        .ok_or_else(|| anyhow!("record {} carries no pixel value", id))?;
    let codec = CodecKind::from_name(&record.codec.name);

    let (pixel_type, payload, compressed_size, uncompressed_size) = if codec.is_compressed() {
        let pixel_type = PixelType::from_code(record.codec.parameters).ok_or_else(|| {
            anyhow!(
                "record {} has unknown element-type code {}",
                id,
                record.codec.parameters
            )
        })?;
        let payload = value.to_le_bytes();
        let compressed = usize::try_from(record.compressed_size).unwrap_or(payload.len());
        let uncompressed = usize::try_from(record.uncompressed_size)
            .map_err(|_| anyhow!("record {} has negative uncompressed size", id))?;
        (pixel_type, payload, compressed, uncompressed)
    } else {
        let payload = value.to_le_bytes();
        let size = payload.len();
        (value.pixel_type(), payload, size, size)
    };

    Ok(Frame {
        id,
        rows,
        cols,
        pixel_type,
        payload,
        compressed_size,
        uncompressed_size,
        codec,
        timestamp: record.time_stamp,
    })
}
