pub mod centroid;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use centroid::CentroidModel;
pub use stub::StubModel;

#[cfg(feature = "backend-tract")]
pub use tract::TractModel;

use anyhow::{anyhow, Result};

pub(crate) fn check_input(input: &[f32], mbsz: usize, psz: usize) -> Result<()> {
    let expected = mbsz
        .checked_mul(psz)
        .and_then(|v| v.checked_mul(psz))
        .ok_or_else(|| anyhow!("batch dimensions overflow"))?;
    if input.len() != expected {
        return Err(anyhow!(
            "expected {} input values for [{}, 1, {}, {}], received {}",
            expected,
            mbsz,
            psz,
            psz,
            input.len()
        ));
    }
    Ok(())
}
