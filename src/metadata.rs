//! Telemetry file metadata structures

use crate::compression::CompressionMethod;
use crate::derive::Formula;
use crate::types::SampleEncoding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Telemetry file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion(pub u16);

impl FormatVersion {
    pub const CURRENT: Self = Self(1);

    pub fn is_supported(&self) -> bool {
        self.0 >= 1 && self.0 <= Self::CURRENT.0
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Whether a channel was recorded or computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKind {
    Raw,
    Derived {
        /// Indices of the raw channels feeding the formula
        sources: Vec<usize>,
        formula: Formula,
    },
}

/// Description of one channel of a telemetry file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    /// Position in the channel list (raw channels first, then derived)
    pub index: usize,
    pub id: String,
    pub label: String,
    pub unit: String,
    #[serde(flatten)]
    pub kind: ChannelKind,
    /// Acquisition-time downsampling relative to the global rate
    pub downsampling: u32,
    pub sample_count: u64,
    /// Bytes occupied by the channel block on disk (0 for derived channels)
    pub stored_len: u64,
    /// Raw code to physical unit: `raw * scale + offset`
    pub scale: f64,
    pub offset: f64,
}

impl ChannelDescriptor {
    /// Create a raw channel descriptor with identity scaling
    pub fn raw(
        index: usize,
        id: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            index,
            id: id.into(),
            label: label.into(),
            unit: unit.into(),
            kind: ChannelKind::Raw,
            downsampling: 1,
            sample_count: 0,
            stored_len: 0,
            scale: 1.0,
            offset: 0.0,
        }
    }

    /// Set the acquisition downsampling factor
    pub fn with_downsampling(mut self, factor: u32) -> Self {
        self.downsampling = factor;
        self
    }

    /// Set the linear raw-to-physical mapping
    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, ChannelKind::Derived { .. })
    }
}

/// Header of a telemetry file, including its raw channel table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    pub version: FormatVersion,
    pub encoding: SampleEncoding,
    pub compression: CompressionMethod,
    /// Global sampling rate in Hz
    pub sampling_rate: f64,
    /// Duration declared by the recorder, in seconds
    pub duration_s: f64,
    /// Samples per channel at the global rate
    pub buffer_size: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub channels: Vec<Arc<ChannelDescriptor>>,
}

impl FileHeader {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Look up a raw channel by index
    pub fn channel(&self, index: usize) -> Option<&Arc<ChannelDescriptor>> {
        self.channels.get(index)
    }

    /// Look up a raw channel by identifier
    pub fn channel_by_id(&self, id: &str) -> Option<&Arc<ChannelDescriptor>> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Sample period in milliseconds for a given downsampling factor
    pub fn period_ms(&self, downsampling: u32) -> f64 {
        downsampling as f64 * 1000.0 / self.sampling_rate
    }

    /// Expected sample count for a given downsampling factor
    pub fn samples_for(&self, downsampling: u32) -> u64 {
        self.buffer_size.div_ceil(downsampling.max(1) as u64)
    }

    /// Get a summary string of the header
    pub fn summary(&self) -> String {
        format!(
            "v{} {} channels @ {} Hz, {} samples ({:.1} s), {} / {:?}",
            self.version.0,
            self.channel_count(),
            self.sampling_rate,
            self.buffer_size,
            self.duration_s,
            self.encoding,
            self.compression,
        )
    }
}
