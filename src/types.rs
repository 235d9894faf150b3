//! Core data types for labscope

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// On-disk encoding of raw samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SampleEncoding {
    /// Signed 16-bit integer (typical ADC output)
    I16 = 0,
    /// Unsigned 16-bit integer
    U16 = 1,
    /// Signed 32-bit integer
    I32 = 2,
    /// 32-bit floating point
    F32 = 3,
    /// 64-bit floating point
    F64 = 4,
}

impl SampleEncoding {
    /// Get the encoding from its byte code
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SampleEncoding::I16),
            1 => Some(SampleEncoding::U16),
            2 => Some(SampleEncoding::I32),
            3 => Some(SampleEncoding::F32),
            4 => Some(SampleEncoding::F64),
            _ => None,
        }
    }

    /// Size in bytes of one sample
    pub fn size_in_bytes(&self) -> usize {
        match self {
            SampleEncoding::I16 | SampleEncoding::U16 => 2,
            SampleEncoding::I32 | SampleEncoding::F32 => 4,
            SampleEncoding::F64 => 8,
        }
    }

    /// Raw code reserved for "no data" in integer encodings.
    ///
    /// Float encodings use NaN instead.
    pub fn sentinel(&self) -> Option<i64> {
        match self {
            SampleEncoding::I16 => Some(i16::MIN as i64),
            SampleEncoding::U16 => Some(u16::MAX as i64),
            SampleEncoding::I32 => Some(i32::MIN as i64),
            SampleEncoding::F32 | SampleEncoding::F64 => None,
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Visual character of a channel, used to pick a reduction at high ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalClass {
    /// Narrow transients matter (current, pressure, trigger lines)
    #[default]
    Spiky,
    /// Energy matters more than individual peaks (vibration, acceleration)
    Noisy,
    /// Smooth analog curves (displacement, position, temperature)
    Smooth,
}

/// A dense, time-ordered run of samples for one channel.
///
/// `NaN` marks indices with no acquired data. The time base is shared
/// between channels recorded with the same downsampling factor.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    channel_id: String,
    times: Arc<[f64]>,
    values: Vec<f64>,
}

impl SampleBuffer {
    /// Create a buffer over a (possibly shared) time base.
    ///
    /// # Panics
    /// Panics if `times` and `values` differ in length.
    pub fn new(channel_id: impl Into<String>, times: Arc<[f64]>, values: Vec<f64>) -> Self {
        assert_eq!(
            times.len(),
            values.len(),
            "time base and values must have equal length"
        );
        debug_assert!(times.windows(2).all(|w| w[0] <= w[1]));
        Self {
            channel_id: channel_id.into(),
            times,
            values,
        }
    }

    /// Build a buffer with a uniform time base starting at `start_ms`
    pub fn uniform(
        channel_id: impl Into<String>,
        start_ms: f64,
        period_ms: f64,
        values: Vec<f64>,
    ) -> Self {
        let times: Arc<[f64]> = (0..values.len())
            .map(|i| start_ms + i as f64 * period_ms)
            .collect();
        Self::new(channel_id, times, values)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Shared handle to the time base
    pub fn time_base(&self) -> &Arc<[f64]> {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First and last timestamp, if any
    pub fn span(&self) -> Option<(f64, f64)> {
        match (self.times.first(), self.times.last()) {
            (Some(&first), Some(&last)) => Some((first, last)),
            _ => None,
        }
    }

    /// Copy out a sub-range of samples
    pub fn slice(&self, range: std::ops::Range<usize>) -> SampleBuffer {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        SampleBuffer::new(
            self.channel_id.clone(),
            self.times[start..end].into(),
            self.values[start..end].to_vec(),
        )
    }

    /// Whether two buffers sit on the same time base
    pub fn shares_time_base(&self, other: &SampleBuffer) -> bool {
        Arc::ptr_eq(&self.times, &other.times) || self.times[..] == other.times[..]
    }
}

/// Value range of a channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_sizes() {
        assert_eq!(SampleEncoding::I16.size_in_bytes(), 2);
        assert_eq!(SampleEncoding::U16.size_in_bytes(), 2);
        assert_eq!(SampleEncoding::F32.size_in_bytes(), 4);
        assert_eq!(SampleEncoding::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_encoding_codes() {
        for code in 0..5u8 {
            let encoding = SampleEncoding::from_u8(code).unwrap();
            assert_eq!(encoding as u8, code);
        }
        assert_eq!(SampleEncoding::from_u8(5), None);
        assert_eq!(SampleEncoding::U16.sentinel(), Some(65535));
        assert_eq!(SampleEncoding::F64.sentinel(), None);
    }

    #[test]
    fn test_uniform_buffer() {
        let buffer = SampleBuffer::uniform("ch0", 0.0, 0.5, vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.times(), &[0.0, 0.5, 1.0]);
        assert_eq!(buffer.span(), Some((0.0, 1.0)));
        assert_eq!(buffer.channel_id(), "ch0");
    }

    #[test]
    fn test_slice_clamps() {
        let buffer = SampleBuffer::uniform("ch0", 0.0, 1.0, vec![0.0, 1.0, 2.0, 3.0]);
        let slice = buffer.slice(1..3);
        assert_eq!(slice.times(), &[1.0, 2.0]);
        assert_eq!(slice.values(), &[1.0, 2.0]);
        assert!(buffer.slice(3..10).len() == 1);
        assert!(buffer.slice(8..10).is_empty());
    }

    #[test]
    fn test_shared_time_base() {
        let a = SampleBuffer::uniform("a", 0.0, 1.0, vec![0.0; 4]);
        let b = SampleBuffer::new("b", Arc::clone(a.time_base()), vec![1.0; 4]);
        let c = SampleBuffer::uniform("c", 0.0, 2.0, vec![1.0; 4]);
        assert!(a.shares_time_base(&b));
        assert!(!a.shares_time_base(&c));
    }

    #[test]
    fn test_signal_class_serde() {
        let class: SignalClass = serde_json::from_str("\"noisy\"").unwrap();
        assert_eq!(class, SignalClass::Noisy);
        assert_eq!(SignalClass::default(), SignalClass::Spiky);
    }
}
