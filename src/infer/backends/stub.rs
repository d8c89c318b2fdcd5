use anyhow::Result;

use super::check_input;
use crate::infer::RefinementModel;

/// Stub model for tests. Puts every peak at the patch centre.
#[derive(Clone, Debug, Default)]
pub struct StubModel {
    batches: u64,
}

impl StubModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }
}

impl RefinementModel for StubModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, input: &[f32], mbsz: usize, psz: usize) -> Result<Vec<[f32; 2]>> {
        check_input(input, mbsz, psz)?;
        self.batches += 1;
        Ok(vec![[0.5, 0.5]; mbsz])
    }
}
