//! Data layout - where each channel block lives inside a telemetry file

use crate::error::CodecError;
use crate::index::SampleIndexRange;
use crate::metadata::FileHeader;
use std::ops::Range;

/// Size of the fixed header block
pub const HEADER_LEN: u64 = 64;

/// Size of one entry in the channel descriptor table
pub const DESCRIPTOR_LEN: u64 = 128;

/// Upper bound on channels accepted from a header
pub const MAX_CHANNELS: u32 = 4096;

/// Location of one channel's sample block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBlock {
    /// Absolute file offset of the first stored byte
    pub offset: u64,
    /// Bytes stored on disk (compressed length when compressed)
    pub stored_len: u64,
    pub sample_count: u64,
    pub sample_size: u64,
}

impl ChannelBlock {
    /// Decoded length of the block
    pub fn decoded_len(&self) -> u64 {
        self.sample_count.saturating_mul(self.sample_size)
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset.saturating_add(self.stored_len)
    }
}

/// Channel-major layout of a telemetry file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    data_start: u64,
    seekable: bool,
    blocks: Vec<ChannelBlock>,
}

impl DataLayout {
    /// Compute block offsets from a parsed header
    pub fn from_header(header: &FileHeader) -> Self {
        let data_start = table_end(header.channel_count() as u64);
        let sample_size = header.encoding.size_in_bytes() as u64;
        let mut offset = data_start;
        let blocks = header
            .channels
            .iter()
            .map(|channel| {
                let block = ChannelBlock {
                    offset,
                    stored_len: channel.stored_len,
                    sample_count: channel.sample_count,
                    sample_size,
                };
                offset = offset.saturating_add(channel.stored_len);
                block
            })
            .collect();

        Self {
            data_start,
            seekable: header.compression.is_seekable(),
            blocks,
        }
    }

    /// Offset of the first sample block
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Total file length implied by the header
    pub fn total_len(&self) -> u64 {
        self.blocks
            .last()
            .map(|b| b.byte_range().end)
            .unwrap_or(self.data_start)
    }

    pub fn blocks(&self) -> &[ChannelBlock] {
        &self.blocks
    }

    /// Whether sample ranges can be read without decoding whole blocks
    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn block(&self, channel: usize) -> Result<&ChannelBlock, CodecError> {
        self.blocks.get(channel).ok_or_else(|| {
            CodecError::ChannelNotFound(format!(
                "index {} (file has {} channels)",
                channel,
                self.blocks.len()
            ))
        })
    }

    /// Byte range holding the given samples of a channel.
    ///
    /// Returns `None` for compressed files, where samples cannot be addressed
    /// individually.
    pub fn sample_byte_range(
        &self,
        channel: usize,
        samples: SampleIndexRange,
    ) -> Result<Option<Range<u64>>, CodecError> {
        let block = self.block(channel)?;
        if !self.seekable {
            return Ok(None);
        }
        let end = (samples.end as u64).min(block.sample_count);
        let start = (samples.start as u64).min(end);
        Ok(Some(
            block.offset + start * block.sample_size..block.offset + end * block.sample_size,
        ))
    }

    /// Inverse of [`sample_byte_range`](Self::sample_byte_range): validate a
    /// byte range and resolve the samples it covers.
    pub fn samples_for_bytes(
        &self,
        channel: usize,
        bytes: &Range<u64>,
    ) -> Result<SampleIndexRange, CodecError> {
        let block = self.block(channel)?;
        if !self.seekable {
            return Err(CodecError::InvalidByteRange(
                "compressed blocks cannot be read by byte range".to_string(),
            ));
        }
        let block_range = block.byte_range();
        if bytes.start > bytes.end
            || bytes.start < block_range.start
            || bytes.end > block_range.end
        {
            return Err(CodecError::InvalidByteRange(format!(
                "{:?} outside channel {} block {:?}",
                bytes, channel, block_range
            )));
        }
        let relative_start = bytes.start - block.offset;
        let relative_end = bytes.end - block.offset;
        if relative_start % block.sample_size != 0 || relative_end % block.sample_size != 0 {
            return Err(CodecError::InvalidByteRange(format!(
                "{:?} not aligned to {}-byte samples",
                bytes, block.sample_size
            )));
        }
        Ok(SampleIndexRange::new(
            (relative_start / block.sample_size) as usize,
            (relative_end / block.sample_size) as usize,
        ))
    }
}

/// End of the descriptor table for a given channel count
pub fn table_end(channel_count: u64) -> u64 {
    HEADER_LEN + DESCRIPTOR_LEN * channel_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::metadata::{ChannelDescriptor, FormatVersion};
    use crate::types::SampleEncoding;
    use std::sync::Arc;

    fn create_test_header(compression: CompressionMethod) -> FileHeader {
        let channel = |index: usize, downsampling: u32, count: u64| {
            let mut descriptor =
                ChannelDescriptor::raw(index, format!("ch{index}"), "Signal", "V")
                    .with_downsampling(downsampling);
            descriptor.sample_count = count;
            descriptor.stored_len = count * 2;
            Arc::new(descriptor)
        };
        FileHeader {
            version: FormatVersion::CURRENT,
            encoding: SampleEncoding::I16,
            compression,
            sampling_rate: 1000.0,
            duration_s: 1.0,
            buffer_size: 1000,
            started_at: None,
            channels: vec![channel(0, 1, 1000), channel(1, 4, 250)],
        }
    }

    #[test]
    fn test_block_offsets() {
        let layout = DataLayout::from_header(&create_test_header(CompressionMethod::None));
        assert_eq!(layout.data_start(), 64 + 2 * 128);
        assert_eq!(layout.block(0).unwrap().offset, 320);
        assert_eq!(layout.block(1).unwrap().offset, 320 + 2000);
        assert_eq!(layout.total_len(), 320 + 2000 + 500);
        assert!(matches!(
            layout.block(2),
            Err(CodecError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_oversized_stored_len_saturates() {
        let mut header = create_test_header(CompressionMethod::Zstd);
        let mut first = (*header.channels[0]).clone();
        first.stored_len = u64::MAX;
        header.channels[0] = Arc::new(first);
        let layout = DataLayout::from_header(&header);
        assert_eq!(layout.block(1).unwrap().offset, u64::MAX);
        assert_eq!(layout.total_len(), u64::MAX);
        assert_eq!(layout.blocks().len(), 2);
    }

    #[test]
    fn test_sample_byte_range_round_trip() {
        let layout = DataLayout::from_header(&create_test_header(CompressionMethod::None));
        let samples = SampleIndexRange::new(10, 60);
        let bytes = layout.sample_byte_range(1, samples).unwrap().unwrap();
        assert_eq!(bytes, 2320 + 20..2320 + 120);
        assert_eq!(layout.samples_for_bytes(1, &bytes).unwrap(), samples);
    }

    #[test]
    fn test_sample_byte_range_clamps() {
        let layout = DataLayout::from_header(&create_test_header(CompressionMethod::None));
        let bytes = layout
            .sample_byte_range(1, SampleIndexRange::new(200, 900))
            .unwrap()
            .unwrap();
        assert_eq!(bytes.end, layout.total_len());
    }

    #[test]
    fn test_rejects_bad_byte_ranges() {
        let layout = DataLayout::from_header(&create_test_header(CompressionMethod::None));
        assert!(layout.samples_for_bytes(0, &(321..400)).is_err());
        assert!(layout.samples_for_bytes(0, &(0..10)).is_err());
        assert!(layout.samples_for_bytes(0, &(320..2322)).is_err());
    }

    #[test]
    fn test_compressed_layout_is_not_seekable() {
        let layout = DataLayout::from_header(&create_test_header(CompressionMethod::Zstd));
        assert!(!layout.is_seekable());
        assert_eq!(
            layout
                .sample_byte_range(0, SampleIndexRange::new(0, 10))
                .unwrap(),
            None
        );
    }
}
