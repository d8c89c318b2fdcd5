//! Patch extraction.
//!
//! An extractor turns one decoded frame into fixed-size patches around
//! intensity peaks. Workers own their extractor through an `Arc`, so
//! implementations must be stateless or internally synchronised.

mod peaks;

use anyhow::Result;

use crate::frame::{Patch, RawFrame};

pub use peaks::{PeakPatchExtractor, DEFAULT_MIN_PEAK_EXTENT};

/// Output of one extraction pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    /// Patches in row-major order of peak discovery.
    pub patches: Vec<Patch>,
    /// Peaks rejected for exceeding the patch size.
    pub big_peaks: usize,
    /// Components below the minimum extent, treated as noise.
    pub small_peaks: usize,
    /// Peaks whose crop would leave the frame.
    pub edge_peaks: usize,
}

impl Extraction {
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Finds peaks in a frame and crops `psz x psz` patches around them.
pub trait PatchExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extract patches from `frame`. Pixels at or below `min_intensity` are background.
    fn extract(&self, frame: &RawFrame, psz: usize, min_intensity: f32) -> Result<Extraction>;
}
