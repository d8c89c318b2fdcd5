//! Peak refinement.
//!
//! A `RefinementModel` maps a `[mbsz, 1, psz, psz]` batch of patches to one
//! `(row, col)` correction per patch, in patch-normalised units. The model is
//! owned exclusively by the dispatch thread.

mod backends;
mod dispatch;

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub use backends::{CentroidModel, StubModel};
#[cfg(feature = "backend-tract")]
pub use backends::TractModel;
pub use dispatch::{DispatchSummary, InferenceDispatch};

/// Refinement model contract.
pub trait RefinementModel: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run one batch. `input` holds `mbsz * psz * psz` values; the result has
    /// exactly `mbsz` rows.
    fn infer(&mut self, input: &[f32], mbsz: usize, psz: usize) -> Result<Vec<[f32; 2]>>;

    /// Optional warm-up hook, run once before the first batch.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    Stub,
    #[default]
    Centroid,
    Tract,
}

impl ModelBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelBackend::Stub => "stub",
            ModelBackend::Centroid => "centroid",
            ModelBackend::Tract => "tract",
        }
    }
}

impl FromStr for ModelBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(ModelBackend::Stub),
            "centroid" | "cpu" => Ok(ModelBackend::Centroid),
            "tract" | "onnx" => Ok(ModelBackend::Tract),
            other => Err(anyhow!("unknown model backend '{}'", other)),
        }
    }
}

impl std::fmt::Display for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load and warm up a model. Any failure here is fatal for the pipeline.
pub fn load_model(
    backend: ModelBackend,
    model_path: Option<&Path>,
    mbsz: usize,
    psz: usize,
) -> Result<Box<dyn RefinementModel>> {
    let mut model: Box<dyn RefinementModel> = match backend {
        ModelBackend::Stub => Box::new(StubModel::new()),
        ModelBackend::Centroid => Box::new(CentroidModel::new()),
        ModelBackend::Tract => load_tract(model_path, mbsz, psz)?,
    };
    model.warm_up()?;
    log::info!(
        "{} inference engine initialization completed (mbsz={}, psz={})",
        model.name(),
        mbsz,
        psz
    );
    Ok(model)
}

#[cfg(feature = "backend-tract")]
fn load_tract(model_path: Option<&Path>, mbsz: usize, psz: usize) -> Result<Box<dyn RefinementModel>> {
    let path = model_path.ok_or_else(|| anyhow!("tract backend requires a model path"))?;
    Ok(Box::new(TractModel::new(path, mbsz, psz)?))
}

#[cfg(not(feature = "backend-tract"))]
fn load_tract(_model_path: Option<&Path>, _mbsz: usize, _psz: usize) -> Result<Box<dyn RefinementModel>> {
    Err(anyhow!(
        "tract backend requested but this build lacks the backend-tract feature"
    ))
}
