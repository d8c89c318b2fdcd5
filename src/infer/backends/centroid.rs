use anyhow::Result;

use super::check_input;
use crate::infer::RefinementModel;

/// CPU model: background-subtracted, intensity-weighted centroid of each patch.
///
/// Corrections are pixel coordinates divided by `psz`. A flat patch maps to
/// its centre pixel.
#[derive(Clone, Debug, Default)]
pub struct CentroidModel;

impl CentroidModel {
    pub fn new() -> Self {
        Self
    }
}

fn centroid(patch: &[f32], psz: usize) -> [f32; 2] {
    let floor = patch.iter().copied().fold(f32::INFINITY, f32::min);
    let mut total = 0.0f64;
    let mut row_sum = 0.0f64;
    let mut col_sum = 0.0f64;
    for (idx, value) in patch.iter().enumerate() {
        let w = f64::from(value - floor).max(0.0);
        total += w;
        row_sum += w * (idx / psz) as f64;
        col_sum += w * (idx % psz) as f64;
    }
    let scale = psz as f64;
    if total <= 0.0 || !total.is_finite() {
        let centre = (psz / 2) as f64 / scale;
        return [centre as f32, centre as f32];
    }
    [(row_sum / total / scale) as f32, (col_sum / total / scale) as f32]
}

impl RefinementModel for CentroidModel {
    fn name(&self) -> &'static str {
        "centroid"
    }

    fn infer(&mut self, input: &[f32], mbsz: usize, psz: usize) -> Result<Vec<[f32; 2]>> {
        check_input(input, mbsz, psz)?;
        if psz == 0 {
            return Ok(vec![[0.0, 0.0]; mbsz]);
        }
        Ok(input
            .chunks_exact(psz * psz)
            .map(|patch| centroid(patch, psz))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bright_pixel_is_its_own_centroid() {
        let psz = 5;
        let mut patch = vec![10.0; psz * psz];
        patch[3 * psz + 1] = 110.0;
        let out = CentroidModel::new().infer(&patch, 1, psz).unwrap();
        assert_eq!(out, vec![[3.0 / 5.0, 1.0 / 5.0]]);
    }

    #[test]
    fn flat_and_padding_patches_map_to_the_centre() {
        let psz = 5;
        let input = vec![0.0; 2 * psz * psz];
        let out = CentroidModel::new().infer(&input, 2, psz).unwrap();
        assert_eq!(out, vec![[0.4, 0.4]; 2]);
    }

    #[test]
    fn wrong_input_length_is_rejected() {
        assert!(CentroidModel::new().infer(&[0.0; 10], 1, 3).is_err());
    }
}
