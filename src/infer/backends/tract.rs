#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use super::check_input;
use crate::infer::RefinementModel;

/// ONNX refinement model executed with tract.
///
/// The input fact is pinned to `[mbsz, 1, psz, psz]` at load time, so every
/// batch must be padded to `mbsz` rows.
pub struct TractModel {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    mbsz: usize,
    psz: usize,
}

impl TractModel {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, mbsz: usize, psz: usize) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(mbsz, 1, psz, psz)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, mbsz, psz })
    }
}

impl RefinementModel for TractModel {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, input: &[f32], mbsz: usize, psz: usize) -> Result<Vec<[f32; 2]>> {
        if mbsz != self.mbsz || psz != self.psz {
            return Err(anyhow!(
                "batch [{}, 1, {}, {}] does not match model input [{}, 1, {}, {}]",
                mbsz,
                psz,
                psz,
                self.mbsz,
                self.psz,
                self.psz
            ));
        }
        check_input(input, mbsz, psz)?;

        let tensor = tract_ndarray::Array4::from_shape_vec((mbsz, 1, psz, psz), input.to_vec())
            .context("failed to shape model input")?
            .into_tensor();
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let flat: Vec<f32> = values.iter().copied().collect();
        if flat.len() != mbsz * 2 {
            return Err(anyhow!(
                "model produced {} values, expected {}x2",
                flat.len(),
                mbsz
            ));
        }
        Ok(flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
    }

    fn warm_up(&mut self) -> Result<()> {
        let zeros = vec![0.0f32; self.mbsz * self.psz * self.psz];
        let (mbsz, psz) = (self.mbsz, self.psz);
        self.infer(&zeros, mbsz, psz).map(|_| ())
    }
}
