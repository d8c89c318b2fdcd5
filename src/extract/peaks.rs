use anyhow::{anyhow, Result};

use super::{Extraction, PatchExtractor};
use crate::frame::{Patch, PatchOrigin, RawFrame};

pub const DEFAULT_MIN_PEAK_EXTENT: usize = 3;

/// Connected-component peak finder.
///
/// Pixels above the threshold are grouped with 8-connectivity. Each component
/// narrower or shorter than `min_peak_extent` is noise; one larger than the
/// patch in either direction is a big peak. The rest get a patch centred on
/// their brightest pixel.
#[derive(Clone, Debug)]
pub struct PeakPatchExtractor {
    min_peak_extent: usize,
}

impl PeakPatchExtractor {
    pub fn new(min_peak_extent: usize) -> Self {
        Self { min_peak_extent }
    }

    pub fn min_peak_extent(&self) -> usize {
        self.min_peak_extent
    }
}

impl Default for PeakPatchExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PEAK_EXTENT)
    }
}

struct Component {
    min_row: usize,
    max_row: usize,
    min_col: usize,
    max_col: usize,
    peak_row: usize,
    peak_col: usize,
    peak_value: f32,
}

impl Component {
    fn seed(row: usize, col: usize, value: f32) -> Self {
        Self {
            min_row: row,
            max_row: row,
            min_col: col,
            max_col: col,
            peak_row: row,
            peak_col: col,
            peak_value: value,
        }
    }

    fn add(&mut self, row: usize, col: usize, value: f32) {
        self.min_row = self.min_row.min(row);
        self.max_row = self.max_row.max(row);
        self.min_col = self.min_col.min(col);
        self.max_col = self.max_col.max(col);
        // ties resolve to the first pixel in row-major order
        let earlier = (row, col) < (self.peak_row, self.peak_col);
        if value > self.peak_value || (value == self.peak_value && earlier) {
            self.peak_row = row;
            self.peak_col = col;
            self.peak_value = value;
        }
    }

    fn height(&self) -> usize {
        self.max_row - self.min_row + 1
    }

    fn width(&self) -> usize {
        self.max_col - self.min_col + 1
    }
}

fn label_components(frame: &RawFrame, min_intensity: f32) -> Vec<Component> {
    let (rows, cols) = (frame.rows, frame.cols);
    let mut visited = vec![false; rows * cols];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for row in 0..rows {
        for col in 0..cols {
            let idx = row * cols + col;
            if visited[idx] {
                continue;
            }
            let value = frame.value(row, col);
            if value <= min_intensity {
                continue;
            }
            visited[idx] = true;
            let mut component = Component::seed(row, col, value);
            stack.push((row, col));
            while let Some((r, c)) = stack.pop() {
                for nr in r.saturating_sub(1)..=(r + 1).min(rows - 1) {
                    for nc in c.saturating_sub(1)..=(c + 1).min(cols - 1) {
                        let nidx = nr * cols + nc;
                        if visited[nidx] {
                            continue;
                        }
                        let v = frame.value(nr, nc);
                        if v > min_intensity {
                            visited[nidx] = true;
                            component.add(nr, nc, v);
                            stack.push((nr, nc));
                        }
                    }
                }
            }
            components.push(component);
        }
    }
    components
}

impl PatchExtractor for PeakPatchExtractor {
    fn name(&self) -> &'static str {
        "peaks"
    }

    fn extract(&self, frame: &RawFrame, psz: usize, min_intensity: f32) -> Result<Extraction> {
        if psz == 0 {
            return Err(anyhow!("patch size must be positive"));
        }
        let mut out = Extraction::default();
        if frame.rows == 0 || frame.cols == 0 {
            return Ok(out);
        }
        let half = psz / 2;

        for component in label_components(frame, min_intensity) {
            if component.height() < self.min_peak_extent || component.width() < self.min_peak_extent {
                out.small_peaks += 1;
                continue;
            }
            if component.height() > psz || component.width() > psz {
                out.big_peaks += 1;
                continue;
            }
            let (Some(row_offset), Some(col_offset)) = (
                component.peak_row.checked_sub(half),
                component.peak_col.checked_sub(half),
            ) else {
                out.edge_peaks += 1;
                continue;
            };
            if row_offset + psz > frame.rows || col_offset + psz > frame.cols {
                out.edge_peaks += 1;
                continue;
            }

            let mut pixels = Vec::with_capacity(psz * psz);
            for r in row_offset..row_offset + psz {
                for c in col_offset..col_offset + psz {
                    pixels.push(frame.value(r, c));
                }
            }
            out.patches.push(Patch {
                pixels,
                origin: PatchOrigin {
                    frame_id: frame.id,
                    row_offset,
                    col_offset,
                    peak_row: component.peak_row,
                    peak_col: component.peak_col,
                },
            });
        }
        Ok(out)
    }
}
