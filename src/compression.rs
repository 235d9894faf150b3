//! Block compression for channel sample data

use crate::error::CodecError;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression applied independently to each channel block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression; the only method that allows partial range reads
    #[default]
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 2,
}

impl CompressionMethod {
    /// Get the method from a byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            2 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    /// Whether byte offsets inside a block map directly to samples
    pub fn is_seekable(&self) -> bool {
        matches!(self, CompressionMethod::None)
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for block compression/decompression
pub trait BlockCodec: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, CodecError>;

    /// Decompress a block; `expected_size` is the decoded length declared by the header
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError>;

    fn method(&self) -> CompressionMethod;
}

/// Stored as-is
#[derive(Debug, Default)]
pub struct Uncompressed;

impl BlockCodec for Uncompressed {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: usize) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Default)]
pub struct DeflateCodec;

impl BlockCodec for DeflateCodec {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, CodecError> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded(DeflateDecoder::new(data), data.len(), expected_size)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

#[derive(Debug, Default)]
pub struct ZstdCodec;

impl BlockCodec for ZstdCodec {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        read_bounded(decoder, data.len(), expected_size)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Largest up-front reservation, as a multiple of the compressed size
const MAX_RESERVE_RATIO: usize = 16;

/// Read at most one byte past `expected_size`, so a block that inflates
/// beyond its declared length fails the length check instead of exhausting
/// memory.
fn read_bounded(
    decoder: impl Read,
    compressed_len: usize,
    expected_size: usize,
) -> Result<Vec<u8>, CodecError> {
    let reserve = expected_size.min(compressed_len.saturating_mul(MAX_RESERVE_RATIO));
    let mut decompressed = Vec::with_capacity(reserve);
    decoder
        .take((expected_size as u64).saturating_add(1))
        .read_to_end(&mut decompressed)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(decompressed)
}

/// Get a codec for a given method
pub fn get_block_codec(method: CompressionMethod) -> Box<dyn BlockCodec> {
    match method {
        CompressionMethod::None => Box::new(Uncompressed),
        CompressionMethod::Deflate => Box::new(DeflateCodec),
        CompressionMethod::Zstd => Box::new(ZstdCodec),
    }
}

/// Decompress a block and check it against the declared decoded length
pub fn decode_block(
    method: CompressionMethod,
    data: &[u8],
    expected_size: usize,
) -> Result<Vec<u8>, CodecError> {
    let decoded = get_block_codec(method).decompress(data, expected_size)?;
    if decoded.len() != expected_size {
        return Err(CodecError::Decompression(format!(
            "block decoded to {} bytes, header declares {}",
            decoded.len(),
            expected_size
        )));
    }
    Ok(decoded)
}
