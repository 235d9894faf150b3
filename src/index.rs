//! Time-range indexing: millisecond windows to sample index windows
//!
//! Lookups are binary searches over a monotonic time base. A time base can be
//! a decoded [`SampleBuffer`] or a [`UniformTimeBase`] computed from the file
//! header alone, which lets range queries resolve byte offsets before any
//! sample data has been read.

use crate::error::ValidationError;
use crate::metadata::{ChannelDescriptor, FileHeader};
use crate::types::SampleBuffer;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Half-open range of sample indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleIndexRange {
    pub start: usize,
    pub end: usize,
}

impl SampleIndexRange {
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    pub fn new(start: usize, end: usize) -> Self {
        if start >= end {
            Self::EMPTY
        } else {
            Self { start, end }
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Whether the range covers all of `len` samples
    pub fn is_full(&self, len: usize) -> bool {
        self.start == 0 && self.end == len
    }
}

/// Optional millisecond bounds of a query; `None` means open
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start_ms: Option<f64>,
    pub end_ms: Option<f64>,
}

impl TimeWindow {
    pub fn new(start_ms: Option<f64>, end_ms: Option<f64>) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn between(start_ms: f64, end_ms: f64) -> Self {
        Self::new(Some(start_ms), Some(end_ms))
    }

    /// A window with no bounds selects everything
    pub fn is_open(&self) -> bool {
        self.start_ms.is_none() && self.end_ms.is_none()
    }

    /// Reject non-finite bounds and `end <= start`
    pub fn validate(&self) -> Result<(), ValidationError> {
        for bound in [self.start_ms, self.end_ms].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(ValidationError::NonFiniteTime(bound));
            }
        }
        if let (Some(start), Some(end)) = (self.start_ms, self.end_ms) {
            if end <= start {
                return Err(ValidationError::TimeRange { start, end });
            }
        }
        Ok(())
    }
}

/// A monotonic sequence of timestamps in milliseconds
pub trait TimeIndex {
    fn len(&self) -> usize;

    fn time_at(&self, index: usize) -> f64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimeIndex for [f64] {
    fn len(&self) -> usize {
        <[f64]>::len(self)
    }

    fn time_at(&self, index: usize) -> f64 {
        self[index]
    }
}

impl TimeIndex for SampleBuffer {
    fn len(&self) -> usize {
        SampleBuffer::len(self)
    }

    fn time_at(&self, index: usize) -> f64 {
        self.times()[index]
    }
}

/// Evenly spaced time base derived from header fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformTimeBase {
    pub start_ms: f64,
    pub period_ms: f64,
    pub len: usize,
}

impl UniformTimeBase {
    pub fn new(start_ms: f64, period_ms: f64, len: usize) -> Self {
        Self {
            start_ms,
            period_ms,
            len,
        }
    }

    /// Time base of a raw channel as recorded
    pub fn for_channel(header: &FileHeader, channel: &ChannelDescriptor) -> Self {
        Self::new(
            0.0,
            header.period_ms(channel.downsampling),
            channel.sample_count as usize,
        )
    }
}

impl TimeIndex for UniformTimeBase {
    fn len(&self) -> usize {
        self.len
    }

    fn time_at(&self, index: usize) -> f64 {
        self.start_ms + index as f64 * self.period_ms
    }
}

/// First index in `0..len` for which `pred` is false
fn partition_point<I: TimeIndex + ?Sized>(index: &I, pred: impl Fn(f64) -> bool) -> usize {
    let (mut lo, mut hi) = (0, index.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(index.time_at(mid)) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Resolve a millisecond window to the tightest sample range inside it.
///
/// The range starts at the first sample at or after `start_ms` and ends after
/// the last sample at or before `end_ms`. Bounds outside the recording clamp
/// to it; a window with no samples inside yields [`SampleIndexRange::EMPTY`].
pub fn locate<I: TimeIndex + ?Sized>(
    index: &I,
    start_ms: Option<f64>,
    end_ms: Option<f64>,
) -> SampleIndexRange {
    if index.is_empty() {
        return SampleIndexRange::EMPTY;
    }
    let first = match start_ms {
        Some(start) => partition_point(index, |t| t < start),
        None => 0,
    };
    let end = match end_ms {
        Some(end) => partition_point(index, |t| t <= end),
        None => index.len(),
    };
    SampleIndexRange::new(first, end)
}

/// [`locate`] with a [`TimeWindow`]
pub fn locate_window<I: TimeIndex + ?Sized>(index: &I, window: &TimeWindow) -> SampleIndexRange {
    locate(index, window.start_ms, window.end_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(len: usize) -> Vec<f64> {
        (0..len).map(|i| i as f64).collect()
    }

    #[test]
    fn test_tightest_bracket() {
        let times = millis(100);
        let range = locate(&times[..], Some(10.5), Some(20.5));
        assert_eq!(range, SampleIndexRange::new(11, 21));
        assert!(times[range.start] >= 10.5);
        assert!(times[range.end - 1] <= 20.5);
        assert!(times[range.start - 1] < 10.5);
        assert!(times[range.end] > 20.5);
    }

    #[test]
    fn test_exact_bounds_are_inclusive() {
        let times = millis(100);
        assert_eq!(
            locate(&times[..], Some(10.0), Some(20.0)),
            SampleIndexRange::new(10, 21)
        );
    }

    #[test]
    fn test_open_bounds() {
        let times = millis(50);
        assert_eq!(locate(&times[..], None, None), SampleIndexRange::new(0, 50));
        assert_eq!(locate(&times[..], Some(45.0), None), SampleIndexRange::new(45, 50));
        assert_eq!(locate(&times[..], None, Some(4.0)), SampleIndexRange::new(0, 5));
    }

    #[test]
    fn test_clamps_partial_overlap() {
        let times = millis(10);
        assert_eq!(
            locate(&times[..], Some(-100.0), Some(3.0)),
            SampleIndexRange::new(0, 4)
        );
        assert_eq!(
            locate(&times[..], Some(7.0), Some(1e9)),
            SampleIndexRange::new(7, 10)
        );
    }

    #[test]
    fn test_outside_span_is_empty() {
        let times = millis(10);
        assert!(locate(&times[..], Some(20.0), Some(30.0)).is_empty());
        assert!(locate(&times[..], Some(-30.0), Some(-20.0)).is_empty());
        assert!(locate(&times[..], Some(4.2), Some(4.8)).is_empty());
        assert!(locate(&times[..], Some(8.0), Some(2.0)).is_empty());
        let empty: Vec<f64> = Vec::new();
        assert!(locate(&empty[..], None, None).is_empty());
    }

    #[test]
    fn test_uniform_time_base_matches_materialised() {
        let uniform = UniformTimeBase::new(0.0, 0.25, 4000);
        let buffer = SampleBuffer::uniform("ch0", 0.0, 0.25, vec![0.0; 4000]);
        for (start, end) in [(0.0, 1.0), (12.3, 456.7), (999.0, 2000.0), (-5.0, 0.1)] {
            assert_eq!(
                locate(&uniform, Some(start), Some(end)),
                locate(&buffer, Some(start), Some(end)),
            );
        }
    }

    #[test]
    fn test_repeated_timestamps() {
        let times = vec![0.0, 1.0, 1.0, 1.0, 2.0];
        assert_eq!(
            locate(&times[..], Some(1.0), Some(1.0)),
            SampleIndexRange::new(1, 4)
        );
    }

    #[test]
    fn test_window_validation() {
        assert!(TimeWindow::between(0.0, 10.0).validate().is_ok());
        assert!(TimeWindow::new(Some(5.0), None).validate().is_ok());
        assert_eq!(
            TimeWindow::between(10.0, 10.0).validate(),
            Err(ValidationError::TimeRange {
                start: 10.0,
                end: 10.0
            })
        );
        assert!(matches!(
            TimeWindow::new(Some(f64::NAN), None).validate(),
            Err(ValidationError::NonFiniteTime(_))
        ));
    }
}
