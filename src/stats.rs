//! Per-channel summary statistics

use crate::types::{SampleBuffer, ValueRange};
use serde::{Deserialize, Serialize};

/// Summary of the acquired samples of one channel.
///
/// "No data" samples (`NaN`) and non-finite values are skipped; a channel
/// without any acquired samples reports `count == 0` and `None` elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub rms: Option<f64>,
    pub count: usize,
}

impl ChannelStatistics {
    /// Statistics over a slice of physical values
    pub fn from_values(values: &[f64]) -> Self {
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for &v in values.iter().filter(|v| v.is_finite()) {
            count += 1;
            min = min.min(v);
            max = max.max(v);
            sum += v;
            sum_sq += v * v;
        }
        if count == 0 {
            return Self {
                min: None,
                max: None,
                avg: None,
                rms: None,
                count,
            };
        }
        let n = count as f64;
        Self {
            min: Some(min),
            max: Some(max),
            avg: Some(sum / n),
            rms: Some((sum_sq / n).sqrt()),
            count,
        }
    }

    pub fn from_buffer(buffer: &SampleBuffer) -> Self {
        Self::from_values(buffer.values())
    }

    pub fn range(&self) -> Option<ValueRange> {
        Some(ValueRange::new(self.min?, self.max?))
    }
}
