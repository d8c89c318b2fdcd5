//! Live per-patch republishing on a channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::SinkWriter;
use crate::channel::{NdArrayRecord, RecordServer};
use crate::frame::{PixelBuffer, RefinedResult};

pub const LIVE_DESCRIPTOR: &str = "Bragg Peak";
pub const DEFAULT_SETUP_DELAY: Duration = Duration::from_secs(1);

/// One refined peak, as republished.
#[derive(Clone, Debug, PartialEq)]
pub struct LivePatch {
    pub unique_id: i64,
    pub psz: usize,
    pub image: Vec<i32>,
    /// Refined location in frame coordinates.
    pub loc_fy: f32,
    pub loc_fx: f32,
    /// Refined location inside the patch.
    pub loc_py: f32,
    pub loc_px: f32,
    /// Index of the patch within its result.
    pub patch_id: usize,
}

impl LivePatch {
    pub fn to_record(&self) -> NdArrayRecord {
        NdArrayRecord::image(
            self.unique_id,
            self.psz,
            self.psz,
            PixelBuffer::I32(self.image.clone()),
        )
        .with_descriptor(LIVE_DESCRIPTOR)
        .with_attribute("loc_fy", f64::from(self.loc_fy))
        .with_attribute("loc_fx", f64::from(self.loc_fx))
        .with_attribute("loc_py", f64::from(self.loc_py))
        .with_attribute("loc_px", f64::from(self.loc_px))
        .with_attribute("patchId", self.patch_id as f64)
    }
}

/// Rate-limited republisher. The first record creates the channel, later ones update it.
pub struct LiveRepublisher {
    server: Arc<dyn RecordServer>,
    channel: String,
    freq: f64,
    setup_delay: Duration,
    registered: bool,
}

impl LiveRepublisher {
    /// `freq` is the maximum number of records per second; non-positive disables the cap.
    pub fn new(server: Arc<dyn RecordServer>, channel: &str, freq: f64) -> Self {
        Self {
            server,
            channel: channel.to_string(),
            freq,
            setup_delay: DEFAULT_SETUP_DELAY,
            registered: false,
        }
    }

    pub fn with_setup_delay(mut self, setup_delay: Duration) -> Self {
        self.setup_delay = setup_delay;
        self
    }
}

impl SinkWriter for LiveRepublisher {
    type Message = LivePatch;

    fn name(&self) -> String {
        format!("live:{}", self.channel)
    }

    fn prepare(result: &RefinedResult) -> Vec<LivePatch> {
        let psz = result.batch.psz;
        result
            .ploc()
            .into_iter()
            .zip(&result.batch.patches)
            .enumerate()
            .map(|(patch_id, (ploc, patch))| LivePatch {
                unique_id: result.frame_id,
                psz,
                image: patch.pixels.iter().map(|v| *v as i32).collect(),
                loc_fy: ploc[1] + ploc[3],
                loc_fx: ploc[2] + ploc[4],
                loc_py: ploc[3],
                loc_px: ploc[4],
                patch_id,
            })
            .collect()
    }

    fn write(&mut self, patch: LivePatch) -> Result<()> {
        let record = patch.to_record();
        if self.registered {
            self.server.update(&self.channel, record)?;
        } else {
            self.server.add_record(&self.channel, record)?;
            self.registered = true;
            log::info!("live record '{}' registered", self.channel);
            std::thread::sleep(self.setup_delay);
        }
        log::debug!(
            "patch {} of frame {} republished on {}",
            patch.patch_id,
            patch.unique_id,
            self.channel
        );
        Ok(())
    }

    fn min_interval(&self) -> Option<Duration> {
        if self.freq > 0.0 && self.freq.is_finite() {
            Some(Duration::from_secs_f64(1.0 / self.freq))
        } else {
            None
        }
    }
}
