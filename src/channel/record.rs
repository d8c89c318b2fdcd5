//! NDArray-shaped records carried on a named channel.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::frame::PixelBuffer;

/// Wall-clock timestamp split into whole seconds and a nanosecond remainder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStamp {
    pub sec: i64,
    pub nsec: i32,
}

impl TimeStamp {
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: now.as_secs() as i64,
            nsec: now.subsec_nanos() as i32,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }
}

/// Compression codec descriptor. An empty name means "uncompressed".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    pub name: String,
    /// Element-type code of the uncompressed data.
    pub parameters: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    pub size: usize,
    pub offset: usize,
    pub full_size: usize,
    pub binning: usize,
    pub reverse: bool,
}

impl Dimension {
    pub fn full(size: usize) -> Self {
        Self {
            size,
            offset: 0,
            full_size: size,
            binning: 1,
            reverse: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: f64,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One image record. `dimension[0]` is the column (x) axis, `dimension[1]` the row (y) axis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NdArrayRecord {
    pub unique_id: i64,
    pub codec: Codec,
    pub dimension: Vec<Dimension>,
    pub compressed_size: i64,
    pub uncompressed_size: i64,
    pub time_stamp: TimeStamp,
    pub data_time_stamp: TimeStamp,
    pub descriptor: String,
    pub value: Option<PixelBuffer>,
    pub attribute: Vec<Attribute>,
}

impl NdArrayRecord {
    /// Uncompressed `rows x cols` image record stamped with the current time.
    pub fn image(unique_id: i64, rows: usize, cols: usize, value: PixelBuffer) -> Self {
        let size = (value.len() * value.pixel_type().element_size()) as i64;
        let ts = TimeStamp::now();
        Self {
            unique_id,
            codec: Codec::default(),
            dimension: vec![Dimension::full(cols), Dimension::full(rows)],
            compressed_size: size,
            uncompressed_size: size,
            time_stamp: ts,
            data_time_stamp: ts,
            descriptor: String::new(),
            value: Some(value),
            attribute: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = descriptor.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: f64) -> Self {
        self.attribute.push(Attribute::new(name, value));
        self
    }

    pub fn cols(&self) -> Option<usize> {
        self.dimension.first().map(|d| d.size)
    }

    pub fn rows(&self) -> Option<usize> {
        self.dimension.get(1).map(|d| d.size)
    }

    pub fn attribute(&self, name: &str) -> Option<f64> {
        self.attribute
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value)
    }
}
