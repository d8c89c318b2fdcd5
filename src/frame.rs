//! Frame, patch and batch types.
//!
//! These are the units of work that flow between pipeline stages:
//!
//! - `Frame`: one compressed (or raw) detector image as unpacked from the
//!   streaming channel. Consumed exactly once by a decode worker.
//! - `RawFrame`: the decoded `rows x cols` pixel buffer of a frame.
//! - `Patch`: a fixed `psz x psz` crop around a peak plus its origin.
//! - `Batch`: exactly `mbsz` patches (or fewer, only on forced shutdown flush).
//! - `RefinedResult`: a batch together with the refined peak locations.
//!
//! Every stage owns the values it receives; nothing here is shared mutably.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::channel::TimeStamp;
use crate::codec::CodecKind;

// ----------------------------------------------------------------------------
// Pixel element types
// ----------------------------------------------------------------------------

/// Element type of a detector pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl PixelType {
    pub const ALL: [PixelType; 10] = [
        PixelType::I8,
        PixelType::U8,
        PixelType::I16,
        PixelType::U16,
        PixelType::I32,
        PixelType::U32,
        PixelType::I64,
        PixelType::U64,
        PixelType::F32,
        PixelType::F64,
    ];

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            PixelType::I8 | PixelType::U8 => 1,
            PixelType::I16 | PixelType::U16 => 2,
            PixelType::I32 | PixelType::U32 | PixelType::F32 => 4,
            PixelType::I64 | PixelType::U64 | PixelType::F64 => 8,
        }
    }

    /// Name of the value-union field carrying this element type on the channel.
    pub fn value_field(self) -> &'static str {
        match self {
            PixelType::I8 => "byteValue",
            PixelType::U8 => "ubyteValue",
            PixelType::I16 => "shortValue",
            PixelType::U16 => "ushortValue",
            PixelType::I32 => "intValue",
            PixelType::U32 => "uintValue",
            PixelType::I64 => "longValue",
            PixelType::U64 => "ulongValue",
            PixelType::F32 => "floatValue",
            PixelType::F64 => "doubleValue",
        }
    }

    pub fn from_value_field(field: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.value_field() == field)
    }

    /// Scalar-type code carried in the codec parameter of compressed records.
    pub fn code(self) -> i32 {
        match self {
            PixelType::I8 => 1,
            PixelType::I16 => 2,
            PixelType::I32 => 3,
            PixelType::I64 => 4,
            PixelType::U8 => 5,
            PixelType::U16 => 6,
            PixelType::U32 => 7,
            PixelType::U64 => 8,
            PixelType::F32 => 9,
            PixelType::F64 => 10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelType::I8 => "i8",
            PixelType::U8 => "u8",
            PixelType::I16 => "i16",
            PixelType::U16 => "u16",
            PixelType::I32 => "i32",
            PixelType::U32 => "u32",
            PixelType::I64 => "i64",
            PixelType::U64 => "u64",
            PixelType::F32 => "f32",
            PixelType::F64 => "f64",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// PixelBuffer: typed pixel array, serialized as the channel value union
// ----------------------------------------------------------------------------

/// Typed pixel array.
///
/// Serializes as a single-key map named after the element type
/// (`{"ushortValue": [...]}`), which is the value union of a channel record.
/// Float elements travel as their IEEE-754 bit patterns so NaN and infinities
/// survive JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    #[serde(rename = "byteValue")]
    I8(Vec<i8>),
    #[serde(rename = "ubyteValue")]
    U8(Vec<u8>),
    #[serde(rename = "shortValue")]
    I16(Vec<i16>),
    #[serde(rename = "ushortValue")]
    U16(Vec<u16>),
    #[serde(rename = "intValue")]
    I32(Vec<i32>),
    #[serde(rename = "uintValue")]
    U32(Vec<u32>),
    #[serde(rename = "longValue")]
    I64(Vec<i64>),
    #[serde(rename = "ulongValue")]
    U64(Vec<u64>),
    #[serde(rename = "floatValue")]
    F32(#[serde(with = "f32_bits")] Vec<f32>),
    #[serde(rename = "doubleValue")]
    F64(#[serde(with = "f64_bits")] Vec<f64>),
}

macro_rules! float_bits {
    ($module:ident, $float:ty, $bits:ty) => {
        mod $module {
            use serde::{Deserialize, Deserializer, Serializer};

            pub fn serialize<S: Serializer>(values: &[$float], serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_seq(values.iter().map(|v| v.to_bits()))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<$float>, D::Error> {
                let bits = Vec::<$bits>::deserialize(deserializer)?;
                Ok(bits.into_iter().map(<$float>::from_bits).collect())
            }
        }
    };
}

float_bits!(f32_bits, f32, u32);
float_bits!(f64_bits, f64, u64);

macro_rules! with_values {
    ($buffer:expr, $values:ident => $body:expr) => {
        match $buffer {
            PixelBuffer::I8($values) => $body,
            PixelBuffer::U8($values) => $body,
            PixelBuffer::I16($values) => $body,
            PixelBuffer::U16($values) => $body,
            PixelBuffer::I32($values) => $body,
            PixelBuffer::U32($values) => $body,
            PixelBuffer::I64($values) => $body,
            PixelBuffer::U64($values) => $body,
            PixelBuffer::F32($values) => $body,
            PixelBuffer::F64($values) => $body,
        }
    };
}

macro_rules! decode_le {
    ($bytes:expr, $t:ty) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$t>())
            .map(|chunk| {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(chunk);
                <$t>::from_le_bytes(raw)
            })
            .collect::<Vec<$t>>()
    };
}

impl PixelBuffer {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelBuffer::I8(_) => PixelType::I8,
            PixelBuffer::U8(_) => PixelType::U8,
            PixelBuffer::I16(_) => PixelType::I16,
            PixelBuffer::U16(_) => PixelType::U16,
            PixelBuffer::I32(_) => PixelType::I32,
            PixelBuffer::U32(_) => PixelType::U32,
            PixelBuffer::I64(_) => PixelType::I64,
            PixelBuffer::U64(_) => PixelType::U64,
            PixelBuffer::F32(_) => PixelType::F32,
            PixelBuffer::F64(_) => PixelType::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pixel value at a flat index, widened to `f32`.
    pub fn value_f32(&self, index: usize) -> Option<f32> {
        with_values!(self, values => values.get(index).map(|v| *v as f32))
    }

    /// Little-endian byte image of the buffer.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        with_values!(self, values => values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Rebuild a typed buffer from its little-endian byte image.
    pub fn from_le_bytes(pixel_type: PixelType, bytes: &[u8]) -> Result<Self> {
        let size = pixel_type.element_size();
        if bytes.len() % size != 0 {
            return Err(anyhow!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                pixel_type
            ));
        }
        Ok(match pixel_type {
            PixelType::I8 => PixelBuffer::I8(bytes.iter().map(|b| *b as i8).collect()),
            PixelType::U8 => PixelBuffer::U8(bytes.to_vec()),
            PixelType::I16 => PixelBuffer::I16(decode_le!(bytes, i16)),
            PixelType::U16 => PixelBuffer::U16(decode_le!(bytes, u16)),
            PixelType::I32 => PixelBuffer::I32(decode_le!(bytes, i32)),
            PixelType::U32 => PixelBuffer::U32(decode_le!(bytes, u32)),
            PixelType::I64 => PixelBuffer::I64(decode_le!(bytes, i64)),
            PixelType::U64 => PixelBuffer::U64(decode_le!(bytes, u64)),
            PixelType::F32 => PixelBuffer::F32(decode_le!(bytes, f32)),
            PixelType::F64 => PixelBuffer::F64(decode_le!(bytes, f64)),
        })
    }
}

// ----------------------------------------------------------------------------
// Frame / RawFrame
// ----------------------------------------------------------------------------

/// One detector frame as received from the channel, still in wire form.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: i64,
    pub rows: usize,
    pub cols: usize,
    /// Element type of the uncompressed pixels.
    pub pixel_type: PixelType,
    /// Compressed payload, or the raw little-endian pixels when uncompressed.
    pub payload: Vec<u8>,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub codec: CodecKind,
    pub timestamp: TimeStamp,
}

/// Message on the raw-frame queue.
#[derive(Debug)]
pub enum WorkerMessage {
    Frame(Frame),
    /// Sentinel: the receiving worker stops pulling and exits.
    Shutdown,
}

/// Decoded `rows x cols` pixel buffer, row-major.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub id: i64,
    pub rows: usize,
    pub cols: usize,
    pub pixels: PixelBuffer,
}

impl RawFrame {
    pub fn new(id: i64, rows: usize, cols: usize, pixels: PixelBuffer) -> Result<Self> {
        let expected = rows
            .checked_mul(cols)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {} has {} pixels, expected {}x{}={}",
                id,
                pixels.len(),
                rows,
                cols,
                expected
            ));
        }
        Ok(Self {
            id,
            rows,
            cols,
            pixels,
        })
    }

    /// Pixel value at `(row, col)`; out-of-range reads return 0.
    pub fn value(&self, row: usize, col: usize) -> f32 {
        if row >= self.rows || col >= self.cols {
            return 0.0;
        }
        self.pixels.value_f32(row * self.cols + col).unwrap_or(0.0)
    }
}

// ----------------------------------------------------------------------------
// Patch / Batch / RefinedResult
// ----------------------------------------------------------------------------

/// Where a patch was cropped from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOrigin {
    pub frame_id: i64,
    /// Top-left corner of the crop in frame coordinates.
    pub row_offset: usize,
    pub col_offset: usize,
    /// Brightest pixel of the peak in frame coordinates.
    pub peak_row: usize,
    pub peak_col: usize,
}

/// A `psz x psz` crop around one peak, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub pixels: Vec<f32>,
    pub origin: PatchOrigin,
}

/// Fixed-size group of patches handed to the refinement model.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub patches: Vec<Patch>,
    pub psz: usize,
    /// Id of the last frame that contributed patches to this batch.
    pub frame_id: i64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Model input laid out as `[len, 1, psz, psz]`, zero-padded to `rows` patches.
    pub fn to_input(&self, rows: usize) -> Vec<f32> {
        let per_patch = self.psz * self.psz;
        let mut input = vec![0.0f32; rows.max(self.len()) * per_patch];
        for (i, patch) in self.patches.iter().enumerate() {
            input[i * per_patch..(i + 1) * per_patch].copy_from_slice(&patch.pixels);
        }
        input
    }
}

/// Refined peak locations for one dispatched batch.
#[derive(Clone, Debug)]
pub struct RefinedResult {
    pub frame_id: i64,
    /// `(row, col)` per patch in frame pixel coordinates.
    pub refined_locations: Vec<(f32, f32)>,
    /// Model output per patch, in patch-normalised units.
    pub corrections: Vec<[f32; 2]>,
    pub batch: Batch,
}

/// Number of columns in a `ploc` row.
pub const PLOC_COLUMNS: usize = 5;

impl RefinedResult {
    /// Compose the result for a batch: `origin + correction * psz` per patch.
    pub fn compose(batch: Batch, corrections: Vec<[f32; 2]>) -> Result<Self> {
        if corrections.len() != batch.len() {
            return Err(anyhow!(
                "model returned {} corrections for {} patches",
                corrections.len(),
                batch.len()
            ));
        }
        let psz = batch.psz as f32;
        let refined_locations = batch
            .patches
            .iter()
            .zip(&corrections)
            .map(|(patch, c)| {
                (
                    patch.origin.row_offset as f32 + c[0] * psz,
                    patch.origin.col_offset as f32 + c[1] * psz,
                )
            })
            .collect();
        Ok(Self {
            frame_id: batch.frame_id,
            refined_locations,
            corrections,
            batch,
        })
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Per-patch metadata rows:
    /// `[frame_id, row_offset, col_offset, correction_row * psz, correction_col * psz]`.
    pub fn ploc(&self) -> Vec<[f32; PLOC_COLUMNS]> {
        let psz = self.batch.psz as f32;
        self.batch
            .patches
            .iter()
            .zip(&self.corrections)
            .map(|(patch, c)| {
                [
                    patch.origin.frame_id as f32,
                    patch.origin.row_offset as f32,
                    patch.origin.col_offset as f32,
                    c[0] * psz,
                    c[1] * psz,
                ]
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patch(frame_id: i64, row: usize, col: usize, psz: usize) -> Patch {
        Patch {
            pixels: vec![1.0; psz * psz],
            origin: PatchOrigin {
                frame_id,
                row_offset: row,
                col_offset: col,
                peak_row: row + psz / 2,
                peak_col: col + psz / 2,
            },
        }
    }

    #[test]
    fn pixel_type_mapping_is_total_and_distinct() {
        let mut fields: Vec<_> = PixelType::ALL.iter().map(|t| t.value_field()).collect();
        let mut codes: Vec<_> = PixelType::ALL.iter().map(|t| t.code()).collect();
        fields.sort();
        fields.dedup();
        codes.sort();
        codes.dedup();
        assert_eq!(fields.len(), 10);
        assert_eq!(codes.len(), 10);
        for t in PixelType::ALL {
            assert_eq!(PixelType::from_value_field(t.value_field()), Some(t));
            assert_eq!(PixelType::from_code(t.code()), Some(t));
        }
    }

    #[test]
    fn buffer_serializes_as_value_union() {
        let json = serde_json::to_string(&PixelBuffer::U16(vec![1, 2])).unwrap();
        assert_eq!(json, r#"{"ushortValue":[1,2]}"#);
        let back: PixelBuffer = serde_json::from_str(r#"{"byteValue":[-1,3]}"#).unwrap();
        assert_eq!(back, PixelBuffer::I8(vec![-1, 3]));
    }

    #[test]
    fn float_buffers_serialize_as_bit_patterns() {
        let json = serde_json::to_string(&PixelBuffer::F32(vec![1.0, f32::NAN])).unwrap();
        assert_eq!(json, r#"{"floatValue":[1065353216,2143289344]}"#);
        let back: PixelBuffer =
            serde_json::from_str(r#"{"doubleValue":[9218868437227405312]}"#).unwrap();
        assert_eq!(back, PixelBuffer::F64(vec![f64::INFINITY]));
    }

    #[test]
    fn from_le_bytes_rejects_partial_elements() {
        assert!(PixelBuffer::from_le_bytes(PixelType::U32, &[0u8; 7]).is_err());
    }

    #[test]
    fn raw_frame_checks_dimensions() {
        assert!(RawFrame::new(1, 2, 3, PixelBuffer::U8(vec![0; 6])).is_ok());
        assert!(RawFrame::new(1, 2, 3, PixelBuffer::U8(vec![0; 5])).is_err());
    }

    #[test]
    fn compose_scales_corrections_by_patch_size() {
        let batch = Batch {
            patches: vec![patch(7, 10, 20, 15), patch(8, 100, 50, 15)],
            psz: 15,
            frame_id: 8,
        };
        let result = RefinedResult::compose(batch, vec![[0.5, 0.5], [0.0, 1.0]]).unwrap();
        assert_eq!(result.frame_id, 8);
        assert_eq!(result.refined_locations, vec![(17.5, 27.5), (100.0, 65.0)]);
        let ploc = result.ploc();
        assert_eq!(ploc[0], [7.0, 10.0, 20.0, 7.5, 7.5]);
        assert_eq!(ploc[1], [8.0, 100.0, 50.0, 0.0, 15.0]);
    }

    #[test]
    fn compose_rejects_length_mismatch() {
        let batch = Batch {
            patches: vec![patch(1, 0, 0, 3)],
            psz: 3,
            frame_id: 1,
        };
        assert!(RefinedResult::compose(batch, vec![]).is_err());
    }

    #[test]
    fn batch_input_is_zero_padded() {
        let batch = Batch {
            patches: vec![patch(1, 0, 0, 2)],
            psz: 2,
            frame_id: 1,
        };
        let input = batch.to_input(3);
        assert_eq!(input.len(), 12);
        assert_eq!(&input[..4], &[1.0; 4]);
        assert!(input[4..].iter().all(|v| *v == 0.0));
    }

    fn any_buffer() -> impl Strategy<Value = PixelBuffer> {
        prop_oneof![
            prop::collection::vec(any::<i8>(), 0..64).prop_map(PixelBuffer::I8),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(PixelBuffer::U8),
            prop::collection::vec(any::<i16>(), 0..64).prop_map(PixelBuffer::I16),
            prop::collection::vec(any::<u16>(), 0..64).prop_map(PixelBuffer::U16),
            prop::collection::vec(any::<i32>(), 0..64).prop_map(PixelBuffer::I32),
            prop::collection::vec(any::<u32>(), 0..64).prop_map(PixelBuffer::U32),
            prop::collection::vec(any::<i64>(), 0..64).prop_map(PixelBuffer::I64),
            prop::collection::vec(any::<u64>(), 0..64).prop_map(PixelBuffer::U64),
            prop::collection::vec(any::<f32>(), 0..64).prop_map(PixelBuffer::F32),
            prop::collection::vec(any::<f64>(), 0..64).prop_map(PixelBuffer::F64),
        ]
    }

    proptest! {
        #[test]
        fn byte_image_round_trips_bit_for_bit(buffer in any_buffer()) {
            let bytes = buffer.to_le_bytes();
            prop_assert_eq!(bytes.len(), buffer.len() * buffer.pixel_type().element_size());
            let back = PixelBuffer::from_le_bytes(buffer.pixel_type(), &bytes).unwrap();
            prop_assert_eq!(back.to_le_bytes(), bytes);
            prop_assert_eq!(back.pixel_type(), buffer.pixel_type());
        }
    }
}
