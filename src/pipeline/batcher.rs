//! Size-aligned batching with cross-frame carryover.

use crate::frame::{Batch, Patch};

/// Worker-local accumulator. Emits batches of exactly `mbsz` patches and keeps
/// the remainder for the next frame.
#[derive(Debug)]
pub struct BatchAccumulator {
    mbsz: usize,
    psz: usize,
    carryover: Vec<Patch>,
    last_frame_id: i64,
}

impl BatchAccumulator {
    pub fn new(mbsz: usize, psz: usize) -> Self {
        Self {
            mbsz: mbsz.max(1),
            psz,
            carryover: Vec::with_capacity(mbsz),
            last_frame_id: -1,
        }
    }

    pub fn mbsz(&self) -> usize {
        self.mbsz
    }

    /// Patches waiting for a full batch.
    pub fn carryover(&self) -> usize {
        self.carryover.len()
    }

    /// Append one frame's patches and cut every full batch.
    pub fn push_frame(&mut self, frame_id: i64, patches: Vec<Patch>) -> Vec<Batch> {
        self.last_frame_id = frame_id;
        self.carryover.extend(patches);

        let full = self.carryover.len() / self.mbsz;
        if full == 0 {
            return Vec::new();
        }
        let remainder = self.carryover.split_off(full * self.mbsz);
        let ready = std::mem::replace(&mut self.carryover, remainder);

        let mut batches = Vec::with_capacity(full);
        let mut patches = ready.into_iter();
        for _ in 0..full {
            batches.push(Batch {
                patches: patches.by_ref().take(self.mbsz).collect(),
                psz: self.psz,
                frame_id,
            });
        }
        batches
    }

    /// Hand out the carryover as an undersized batch.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.carryover.is_empty() {
            return None;
        }
        Some(Batch {
            patches: std::mem::take(&mut self.carryover),
            psz: self.psz,
            frame_id: self.last_frame_id,
        })
    }

    /// Drop the carryover. Returns how many patches were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.carryover.len();
        self.carryover.clear();
        dropped
    }
}
