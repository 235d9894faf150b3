//! Telemetry codec - decoding and encoding of the binary channel format
//!
//! A file is a 64-byte header, a table of 128-byte channel descriptors and
//! one sample block per channel, in table order. All integers and floats are
//! little-endian.
//!
//! ```text
//! header  : magic "LSCP" | version u16 | encoding u8 | compression u8
//!           | channel count u32 | flags u32 | sampling rate f64
//!           | duration s f64 | buffer size u64 | start unix ms i64 | 16 reserved
//! channel : id [24] | label [40] | unit [16] | downsampling u32 | reserved u32
//!           | sample count u64 | stored len u64 | scale f64 | offset f64 | 8 reserved
//! ```
//!
//! Pure functions (`decode_*`, [`TelemetryWriter::encode`]) work on byte slices;
//! the async `read_*` functions add file access on top of them.

use crate::compression::{decode_block, get_block_codec, CompressionLevel, CompressionMethod};
use crate::error::{CodecError, Result};
use crate::index::SampleIndexRange;
use crate::io::Stager;
use crate::layout::{
    table_end, ChannelBlock, DataLayout, DESCRIPTOR_LEN, HEADER_LEN, MAX_CHANNELS,
};
use crate::metadata::{ChannelDescriptor, ChannelKind, FileHeader, FormatVersion};
use crate::types::{SampleBuffer, SampleEncoding};
use crate::utils::{format_bytes, put_fixed_str, read_fixed_str};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Magic number at the start of every telemetry file
pub const TELEMETRY_MAGIC: &[u8; 4] = b"LSCP";

const ID_LEN: usize = 24;
const LABEL_LEN: usize = 40;
const UNIT_LEN: usize = 16;

/// Every channel of a file, decoded
#[derive(Debug, Clone)]
pub struct DecodedFile {
    pub header: Arc<FileHeader>,
    pub buffers: Vec<Arc<SampleBuffer>>,
}

/// Validate the fixed header block and return the total header length
/// (header plus descriptor table).
pub fn header_len(prelude: &[u8]) -> std::result::Result<u64, CodecError> {
    if prelude.len() < HEADER_LEN as usize {
        return Err(CodecError::MalformedHeader(format!(
            "header block needs {} bytes, got {}",
            HEADER_LEN,
            prelude.len()
        )));
    }
    if &prelude[..4] != TELEMETRY_MAGIC {
        return Err(CodecError::MalformedHeader(format!(
            "bad magic {:02x?}",
            &prelude[..4]
        )));
    }
    let channel_count = (&prelude[8..12]).get_u32_le();
    if channel_count == 0 || channel_count > MAX_CHANNELS {
        return Err(CodecError::MalformedHeader(format!(
            "channel count {} outside 1..={}",
            channel_count, MAX_CHANNELS
        )));
    }
    Ok(table_end(channel_count as u64))
}

/// Decode the header and channel table from the start of a file
pub fn decode_header(bytes: &[u8]) -> std::result::Result<FileHeader, CodecError> {
    let total = header_len(bytes)?;
    if (bytes.len() as u64) < total {
        return Err(CodecError::MalformedHeader(format!(
            "descriptor table truncated: need {} bytes, got {}",
            total,
            bytes.len()
        )));
    }

    let mut buf = &bytes[4..HEADER_LEN as usize];
    let version = FormatVersion(buf.get_u16_le());
    if !version.is_supported() {
        return Err(CodecError::UnsupportedVersion(version.0));
    }
    let encoding_code = buf.get_u8();
    let encoding = SampleEncoding::from_u8(encoding_code).ok_or_else(|| {
        CodecError::MalformedHeader(format!("unknown sample encoding {}", encoding_code))
    })?;
    let compression_code = buf.get_u8();
    let compression = CompressionMethod::from_u8(compression_code).ok_or_else(|| {
        CodecError::MalformedHeader(format!("unknown compression {}", compression_code))
    })?;
    let channel_count = buf.get_u32_le() as usize;
    let _flags = buf.get_u32_le();
    let sampling_rate = buf.get_f64_le();
    if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
        return Err(CodecError::MalformedHeader(format!(
            "sampling rate {} is not positive",
            sampling_rate
        )));
    }
    let duration_s = buf.get_f64_le();
    if !duration_s.is_finite() || duration_s < 0.0 {
        return Err(CodecError::MalformedHeader(format!(
            "declared duration {} is invalid",
            duration_s
        )));
    }
    let buffer_size = buf.get_u64_le();
    let started_at = match buf.get_i64_le() {
        0 => None,
        millis => DateTime::<Utc>::from_timestamp_millis(millis),
    };

    let mut header = FileHeader {
        version,
        encoding,
        compression,
        sampling_rate,
        duration_s,
        buffer_size,
        started_at,
        channels: Vec::with_capacity(channel_count),
    };

    let mut seen = HashSet::with_capacity(channel_count);
    for index in 0..channel_count {
        let start = (HEADER_LEN + DESCRIPTOR_LEN * index as u64) as usize;
        let entry = &bytes[start..start + DESCRIPTOR_LEN as usize];
        let descriptor = decode_descriptor(&header, index, entry)?;
        if !seen.insert(descriptor.id.clone()) {
            return Err(CodecError::MalformedHeader(format!(
                "duplicate channel id {:?}",
                descriptor.id
            )));
        }
        header.channels.push(Arc::new(descriptor));
    }

    header
        .channels
        .iter()
        .try_fold(total, |end, channel| end.checked_add(channel.stored_len))
        .ok_or_else(|| {
            CodecError::MalformedHeader("stored block lengths overflow the file size".to_string())
        })?;

    Ok(header)
}

fn decode_descriptor(
    header: &FileHeader,
    index: usize,
    entry: &[u8],
) -> std::result::Result<ChannelDescriptor, CodecError> {
    let mut id = read_fixed_str(&entry[..ID_LEN], "channel id")?;
    if id.is_empty() {
        id = format!("ch{}", index);
    }
    let label = read_fixed_str(&entry[ID_LEN..ID_LEN + LABEL_LEN], "channel label")?;
    let unit = read_fixed_str(
        &entry[ID_LEN + LABEL_LEN..ID_LEN + LABEL_LEN + UNIT_LEN],
        "channel unit",
    )?;

    let mut buf = &entry[ID_LEN + LABEL_LEN + UNIT_LEN..];
    let downsampling = buf.get_u32_le();
    let _reserved = buf.get_u32_le();
    let sample_count = buf.get_u64_le();
    let stored_len = buf.get_u64_le();
    let scale = buf.get_f64_le();
    let offset = buf.get_f64_le();

    let malformed = |what: String| CodecError::MalformedHeader(format!("channel {}: {}", index, what));
    if downsampling == 0 {
        return Err(malformed("downsampling factor is zero".to_string()));
    }
    let expected = header.samples_for(downsampling);
    if sample_count != expected {
        return Err(malformed(format!(
            "{} samples declared, buffer size {} / {} implies {}",
            sample_count, header.buffer_size, downsampling, expected
        )));
    }
    let decoded_len = sample_count
        .checked_mul(header.encoding.size_in_bytes() as u64)
        .filter(|&len| usize::try_from(len).is_ok())
        .ok_or_else(|| malformed(format!("{} samples do not fit in memory", sample_count)))?;
    if header.compression.is_seekable() && stored_len != decoded_len {
        return Err(malformed(format!(
            "stored length {} does not match {} uncompressed bytes",
            stored_len, decoded_len
        )));
    }
    if !scale.is_finite() || !offset.is_finite() {
        return Err(malformed("scaling is not finite".to_string()));
    }

    Ok(ChannelDescriptor {
        index,
        id,
        label,
        unit,
        kind: ChannelKind::Raw,
        downsampling,
        sample_count,
        stored_len,
        scale,
        offset,
    })
}

/// Convert raw little-endian samples to physical values.
///
/// Sentinel codes become `NaN`.
pub fn decode_samples(raw: &[u8], encoding: SampleEncoding, scale: f64, offset: f64) -> Vec<f64> {
    let count = raw.len() / encoding.size_in_bytes();
    let mut buf = raw;
    let physical = |code: f64| code * scale + offset;
    let sentinel = encoding.sentinel();
    let integer = |code: i64| {
        if Some(code) == sentinel {
            f64::NAN
        } else {
            physical(code as f64)
        }
    };
    match encoding {
        SampleEncoding::I16 => (0..count).map(|_| integer(buf.get_i16_le() as i64)).collect(),
        SampleEncoding::U16 => (0..count).map(|_| integer(buf.get_u16_le() as i64)).collect(),
        SampleEncoding::I32 => (0..count).map(|_| integer(buf.get_i32_le() as i64)).collect(),
        SampleEncoding::F32 => (0..count)
            .map(|_| physical(buf.get_f32_le() as f64))
            .collect(),
        SampleEncoding::F64 => (0..count).map(|_| physical(buf.get_f64_le())).collect(),
    }
}

/// Timestamps in milliseconds for samples `range` of a channel
pub fn time_base(header: &FileHeader, downsampling: u32, range: Range<usize>) -> Arc<[f64]> {
    let period = header.period_ms(downsampling);
    range.map(|i| i as f64 * period).collect()
}

/// Physical values of one stored block.
///
/// The decoded size is bounded by the bytes actually present, so time bases
/// are built from the result rather than from the declared sample count.
fn block_values(
    header: &FileHeader,
    channel: &ChannelDescriptor,
    block: &ChannelBlock,
    block_bytes: &[u8],
) -> std::result::Result<Vec<f64>, CodecError> {
    if header.compression.is_seekable() {
        return Ok(decode_samples(block_bytes, header.encoding, channel.scale, channel.offset));
    }
    let decoded_len = usize::try_from(block.decoded_len()).map_err(|_| {
        CodecError::MalformedHeader(format!("channel {} block does not fit in memory", channel.index))
    })?;
    let raw = decode_block(header.compression, block_bytes, decoded_len)?;
    Ok(decode_samples(&raw, header.encoding, channel.scale, channel.offset))
}

fn block_slice<'a>(
    bytes: &'a [u8],
    layout: &DataLayout,
    channel: usize,
) -> std::result::Result<&'a [u8], CodecError> {
    let block = layout.block(channel)?;
    let range = block.byte_range();
    if (bytes.len() as u64) < range.end {
        return Err(CodecError::TruncatedData {
            channel,
            expected: block.stored_len,
            actual: (bytes.len() as u64).saturating_sub(block.offset),
        });
    }
    Ok(&bytes[range.start as usize..range.end as usize])
}

/// Decode a whole in-memory file.
///
/// Channels with the same downsampling factor share one time base.
pub fn decode_file(bytes: &[u8]) -> std::result::Result<DecodedFile, CodecError> {
    let header = decode_header(bytes)?;
    let layout = DataLayout::from_header(&header);
    let mut time_bases: HashMap<u32, Arc<[f64]>> = HashMap::new();
    let mut buffers = Vec::with_capacity(header.channel_count());

    for descriptor in &header.channels {
        let stored = block_slice(bytes, &layout, descriptor.index)?;
        let values = block_values(&header, descriptor, layout.block(descriptor.index)?, stored)?;
        let times = time_bases
            .entry(descriptor.downsampling)
            .or_insert_with(|| time_base(&header, descriptor.downsampling, 0..values.len()))
            .clone();
        buffers.push(Arc::new(SampleBuffer::new(descriptor.id.clone(), times, values)));
    }

    Ok(DecodedFile {
        header: Arc::new(header),
        buffers,
    })
}

fn eof_as(err: std::io::Error, truncated: impl FnOnce() -> CodecError) -> CodecError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        truncated()
    } else {
        CodecError::from(err)
    }
}

/// Read the header and channel table of a telemetry file
pub async fn read_header(path: &Path) -> std::result::Result<FileHeader, CodecError> {
    let mut file = File::open(path).await?;
    let mut bytes = vec![0u8; HEADER_LEN as usize];
    file.read_exact(&mut bytes).await.map_err(|e| {
        eof_as(e, || {
            CodecError::MalformedHeader("file ends inside the header block".to_string())
        })
    })?;

    let total = header_len(&bytes)? as usize;
    bytes.resize(total, 0);
    file.read_exact(&mut bytes[HEADER_LEN as usize..])
        .await
        .map_err(|e| {
            eof_as(e, || {
                CodecError::MalformedHeader("file ends inside the descriptor table".to_string())
            })
        })?;

    let header = decode_header(&bytes)?;
    let file_len = file.metadata().await?.len();
    let layout = DataLayout::from_header(&header);
    for (channel, block) in layout.blocks().iter().enumerate() {
        if block.byte_range().end > file_len {
            return Err(CodecError::TruncatedData {
                channel,
                expected: block.stored_len,
                actual: file_len.saturating_sub(block.offset),
            });
        }
    }
    Ok(header)
}

async fn read_bytes(
    path: &Path,
    channel: usize,
    range: Range<u64>,
) -> std::result::Result<Vec<u8>, CodecError> {
    let mut file = File::open(path).await?;
    let file_len = file.metadata().await?.len();
    if file_len < range.end {
        return Err(CodecError::TruncatedData {
            channel,
            expected: range.end - range.start,
            actual: file_len.saturating_sub(range.start),
        });
    }
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut bytes = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Read one full channel without loading the rest of the file
pub async fn read_channel(
    path: &Path,
    header: &FileHeader,
    channel: usize,
) -> std::result::Result<SampleBuffer, CodecError> {
    let descriptor = header
        .channel(channel)
        .ok_or_else(|| CodecError::ChannelNotFound(format!("index {}", channel)))?;
    let layout = DataLayout::from_header(header);
    let block = layout.block(channel)?;
    let bytes = read_bytes(path, channel, block.byte_range()).await?;
    let values = block_values(header, descriptor, block, &bytes)?;
    let times = time_base(header, descriptor.downsampling, 0..values.len());
    Ok(SampleBuffer::new(descriptor.id.clone(), times, values))
}

/// Read the samples of one channel that lie in `byte_range`.
///
/// The range must be sample-aligned and inside the channel block, as produced
/// by [`DataLayout::sample_byte_range`]. Only uncompressed files support this.
pub async fn read_channel_range(
    path: &Path,
    header: &FileHeader,
    channel: usize,
    byte_range: Range<u64>,
) -> std::result::Result<SampleBuffer, CodecError> {
    let descriptor = header
        .channel(channel)
        .ok_or_else(|| CodecError::ChannelNotFound(format!("index {}", channel)))?;
    let layout = DataLayout::from_header(header);
    let samples = layout.samples_for_bytes(channel, &byte_range)?;
    let bytes = if samples.is_empty() {
        Vec::new()
    } else {
        read_bytes(path, channel, byte_range).await?
    };
    let values = decode_samples(&bytes, header.encoding, descriptor.scale, descriptor.offset);
    let times = time_base(header, descriptor.downsampling, samples.as_range());
    Ok(SampleBuffer::new(descriptor.id.clone(), times, values))
}

/// Read up to `count` samples of a channel starting at `start`.
///
/// `count` is clamped to the samples available; compressed files fall back
/// to decoding the whole block.
pub async fn read_channel_samples(
    path: &Path,
    header: &FileHeader,
    channel: usize,
    start: usize,
    count: usize,
) -> std::result::Result<SampleBuffer, CodecError> {
    let descriptor = header
        .channel(channel)
        .ok_or_else(|| CodecError::ChannelNotFound(format!("index {}", channel)))?;
    let available = descriptor.sample_count as usize;
    let end = start.saturating_add(count).min(available);
    let samples = SampleIndexRange::new(start.min(end), end);

    let layout = DataLayout::from_header(header);
    match layout.sample_byte_range(channel, samples)? {
        Some(bytes) => read_channel_range(path, header, channel, bytes).await,
        None => Ok(read_channel(path, header, channel)
            .await?
            .slice(samples.as_range())),
    }
}

/// Sequentially decode a whole file.
///
/// Files on slow network paths are staged to local storage first; the staged
/// copy is removed whether decoding succeeds or not.
pub async fn read_file(path: &Path, stager: &Stager) -> Result<DecodedFile> {
    let started = Instant::now();
    let bytes = {
        let staged = stager.stage(path).await?;
        let bytes = tokio::fs::read(staged.path()).await.map_err(CodecError::from);
        staged.release().await;
        bytes?
    };
    let size = bytes.len();
    let decoded = tokio::task::spawn_blocking(move || decode_file(&bytes)).await??;

    tracing::info!(
        path = %path.display(),
        header = %decoded.header.summary(),
        size = %format_bytes(size as u64),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "decoded telemetry file"
    );
    Ok(decoded)
}

/// Builder for telemetry files
#[derive(Debug, Clone)]
pub struct TelemetryWriter {
    encoding: SampleEncoding,
    compression: CompressionMethod,
    level: CompressionLevel,
    sampling_rate: f64,
    duration_s: Option<f64>,
    buffer_size: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    channels: Vec<(ChannelDescriptor, Vec<f64>)>,
}

impl TelemetryWriter {
    /// Create a writer for a given global sampling rate in Hz
    pub fn new(sampling_rate: f64) -> Self {
        Self {
            encoding: SampleEncoding::F32,
            compression: CompressionMethod::None,
            level: CompressionLevel::default(),
            sampling_rate,
            duration_s: None,
            buffer_size: None,
            started_at: None,
            channels: Vec::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: SampleEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.level = level;
        self
    }

    pub fn with_start_time(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Override the declared duration (defaults to buffer size / rate)
    pub fn with_duration(mut self, duration_s: f64) -> Self {
        self.duration_s = Some(duration_s);
        self
    }

    /// Override the buffer size (defaults to the longest channel at full rate)
    pub fn with_buffer_size(mut self, buffer_size: u64) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Add a channel with physical values; its descriptor supplies id, label,
    /// unit, downsampling and scaling.
    pub fn add_channel(mut self, descriptor: ChannelDescriptor, values: Vec<f64>) -> Self {
        self.channels.push((descriptor, values));
        self
    }

    fn encode_samples(&self, descriptor: &ChannelDescriptor, values: &[f64]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(values.len() * self.encoding.size_in_bytes());
        let code = |v: f64| (v - descriptor.offset) / descriptor.scale;
        let missing = self.encoding.sentinel().unwrap_or_default();
        // integer codes avoid the sentinel, which marks missing samples
        let integer = |v: f64, lo: f64, hi: f64| {
            if v.is_nan() {
                missing
            } else {
                code(v).round().clamp(lo, hi) as i64
            }
        };
        for &v in values {
            match self.encoding {
                SampleEncoding::I16 => {
                    buf.put_i16_le(integer(v, i16::MIN as f64 + 1.0, i16::MAX as f64) as i16)
                }
                SampleEncoding::U16 => {
                    buf.put_u16_le(integer(v, 0.0, u16::MAX as f64 - 1.0) as u16)
                }
                SampleEncoding::I32 => {
                    buf.put_i32_le(integer(v, i32::MIN as f64 + 1.0, i32::MAX as f64) as i32)
                }
                SampleEncoding::F32 => buf.put_f32_le(code(v) as f32),
                SampleEncoding::F64 => buf.put_f64_le(code(v)),
            }
        }
        buf.to_vec()
    }

    /// Encode the file into memory
    pub fn encode(&self) -> std::result::Result<Bytes, CodecError> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS as usize {
            return Err(CodecError::MalformedHeader(format!(
                "cannot write {} channels",
                self.channels.len()
            )));
        }
        if !self.sampling_rate.is_finite() || self.sampling_rate <= 0.0 {
            return Err(CodecError::MalformedHeader(format!(
                "sampling rate {} is not positive",
                self.sampling_rate
            )));
        }
        let buffer_size = self.buffer_size.unwrap_or_else(|| {
            self.channels
                .iter()
                .map(|(d, v)| v.len() as u64 * d.downsampling.max(1) as u64)
                .max()
                .unwrap_or(0)
        });

        let codec = get_block_codec(self.compression);
        let mut blocks = Vec::with_capacity(self.channels.len());
        for (index, (descriptor, values)) in self.channels.iter().enumerate() {
            let factor = descriptor.downsampling;
            if factor == 0 || values.len() as u64 != buffer_size.div_ceil(factor as u64) {
                return Err(CodecError::MalformedHeader(format!(
                    "channel {} has {} samples, buffer size {} / {} does not match",
                    index,
                    values.len(),
                    buffer_size,
                    factor
                )));
            }
            let raw = self.encode_samples(descriptor, values);
            blocks.push(codec.compress(&raw, self.level)?);
        }

        let total = table_end(self.channels.len() as u64) as usize
            + blocks.iter().map(Vec::len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(TELEMETRY_MAGIC);
        buf.put_u16_le(FormatVersion::CURRENT.0);
        buf.put_u8(self.encoding as u8);
        buf.put_u8(self.compression as u8);
        buf.put_u32_le(self.channels.len() as u32);
        buf.put_u32_le(0);
        buf.put_f64_le(self.sampling_rate);
        buf.put_f64_le(
            self.duration_s
                .unwrap_or(buffer_size as f64 / self.sampling_rate),
        );
        buf.put_u64_le(buffer_size);
        buf.put_i64_le(self.started_at.map(|t| t.timestamp_millis()).unwrap_or(0));
        buf.put_bytes(0, 16);

        for ((descriptor, values), block) in self.channels.iter().zip(&blocks) {
            put_fixed_str(&mut buf, &descriptor.id, ID_LEN);
            put_fixed_str(&mut buf, &descriptor.label, LABEL_LEN);
            put_fixed_str(&mut buf, &descriptor.unit, UNIT_LEN);
            buf.put_u32_le(descriptor.downsampling);
            buf.put_u32_le(0);
            buf.put_u64_le(values.len() as u64);
            buf.put_u64_le(block.len() as u64);
            buf.put_f64_le(descriptor.scale);
            buf.put_f64_le(descriptor.offset);
            buf.put_bytes(0, 8);
        }
        for block in &blocks {
            buf.put_slice(block);
        }

        Ok(buf.freeze())
    }

    /// Encode and write the file to `path`
    pub async fn write_to(&self, path: &Path) -> std::result::Result<(), CodecError> {
        let bytes = self.encode()?;
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }
}
