//! Frame payload codecs.
//!
//! `CodecAdapter` mirrors the decompressor of the detector protocol: feed it a
//! payload plus the sizes from the record, then read back the raw bytes and
//! the compression ratio of the last frame.

use anyhow::{anyhow, Context, Result};

pub const LZ4_NAME: &str = "lz4";

/// Codec named in a channel record.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Empty codec name: the payload is raw pixels.
    #[default]
    None,
    Lz4,
    Unsupported(String),
}

impl CodecKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => CodecKind::None,
            LZ4_NAME => CodecKind::Lz4,
            _ => CodecKind::Unsupported(name.to_string()),
        }
    }

    /// Name carried on the wire. Empty for uncompressed payloads.
    pub fn name(&self) -> &str {
        match self {
            CodecKind::None => "",
            CodecKind::Lz4 => LZ4_NAME,
            CodecKind::Unsupported(name) => name,
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, CodecKind::None)
    }
}

/// Compress `bytes` with `kind`. `CodecKind::None` returns a copy.
pub fn compress(kind: &CodecKind, bytes: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CodecKind::None => Ok(bytes.to_vec()),
        CodecKind::Lz4 => lz4::block::compress(bytes, None, false).context("lz4 compression failed"),
        CodecKind::Unsupported(name) => Err(anyhow!("codec '{}' is not supported", name)),
    }
}

/// Stateful decompressor, one per decode worker.
#[derive(Debug, Default)]
pub struct CodecAdapter {
    data: Vec<u8>,
    compressed: usize,
    uncompressed: usize,
}

impl CodecAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompress one payload into the internal buffer.
    ///
    /// Uncompressed payloads are reported as an error so the caller can fall
    /// back to using the bytes as they are.
    pub fn decompress(
        &mut self,
        payload: &[u8],
        codec: &CodecKind,
        compressed_size: usize,
        uncompressed_size: usize,
    ) -> Result<()> {
        let data = match codec {
            CodecKind::None => return Err(anyhow!("payload is not compressed")),
            CodecKind::Unsupported(name) => {
                return Err(anyhow!("codec '{}' is not supported", name));
            }
            CodecKind::Lz4 => {
                let expected = i32::try_from(uncompressed_size)
                    .map_err(|_| anyhow!("uncompressed size {} too large", uncompressed_size))?;
                lz4::block::decompress(payload, Some(expected)).context("lz4 decompression failed")?
            }
        };
        if data.len() != uncompressed_size {
            return Err(anyhow!(
                "decompressed {} bytes, record claims {}",
                data.len(),
                uncompressed_size
            ));
        }
        self.compressed = if compressed_size == 0 {
            payload.len()
        } else {
            compressed_size
        };
        self.uncompressed = data.len();
        self.data = data;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Move the decompressed bytes out, leaving the adapter empty.
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// `uncompressed / compressed` of the last successful decompress, 1.0 before any.
    pub fn compress_ratio(&self) -> f64 {
        if self.compressed == 0 {
            1.0
        } else {
            self.uncompressed as f64 / self.compressed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_parse() {
        assert_eq!(CodecKind::from_name(""), CodecKind::None);
        assert_eq!(CodecKind::from_name("LZ4"), CodecKind::Lz4);
        assert_eq!(
            CodecKind::from_name("bslz4"),
            CodecKind::Unsupported("bslz4".into())
        );
        assert_eq!(CodecKind::Lz4.name(), "lz4");
    }

    #[test]
    fn lz4_payload_decompresses_and_reports_ratio() {
        let raw: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&CodecKind::Lz4, &raw).unwrap();
        assert!(packed.len() < raw.len());

        let mut adapter = CodecAdapter::new();
        adapter
            .decompress(&packed, &CodecKind::Lz4, packed.len(), raw.len())
            .unwrap();
        assert_eq!(adapter.data(), raw.as_slice());
        let ratio = raw.len() as f64 / packed.len() as f64;
        assert!((adapter.compress_ratio() - ratio).abs() < 1e-9);
        assert_eq!(adapter.take_data(), raw);
        assert!(adapter.data().is_empty());
    }

    #[test]
    fn uncompressed_and_unknown_payloads_fail() {
        let mut adapter = CodecAdapter::new();
        assert!(adapter
            .decompress(&[1, 2, 3], &CodecKind::None, 3, 3)
            .is_err());
        assert!(adapter
            .decompress(&[1, 2, 3], &CodecKind::Unsupported("jpeg".into()), 3, 3)
            .is_err());
        assert_eq!(adapter.compress_ratio(), 1.0);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let packed = compress(&CodecKind::Lz4, &[9u8; 64]).unwrap();
        let mut adapter = CodecAdapter::new();
        assert!(adapter
            .decompress(&packed, &CodecKind::Lz4, packed.len(), 32)
            .is_err());
    }
}
