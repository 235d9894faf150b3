//! Resampling engine - reduce a channel to a bounded number of plot points
//!
//! The algorithm is picked from the oversampling ratio
//! `r = available samples / max points` by [`select_algorithm`]:
//!
//! | ratio | algorithm |
//! |---|---|
//! | `r <= 1` | identity |
//! | `r <= stride_threshold` | stride decimation |
//! | `r <= minmax_threshold` | min-max buckets |
//! | above | by [`SignalClass`]: min-max, RMS buckets or LTTB |
//!
//! Every algorithm emits exactly `min(max_points, available)` points.

use crate::error::ValidationError;
use crate::index::{locate_window, TimeWindow};
use crate::types::{SampleBuffer, SignalClass};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reduction applied to a sample range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingAlgorithm {
    /// Samples returned unchanged
    Identity,
    /// Evenly spaced samples
    Stride,
    /// Minimum and maximum of each bucket, in time order
    MinMax,
    /// Root-mean-square of each bucket at the bucket midpoint
    Rms,
    /// Largest-triangle-three-buckets
    Lttb,
}

impl ResamplingAlgorithm {
    /// Reduce `(times, values)` to exactly `target` points.
    ///
    /// `target` must be at least 1 and below the number of samples for every
    /// algorithm except `Identity`.
    fn reduce(&self, times: &[f64], values: &[f64], target: usize) -> (Vec<f64>, Vec<f64>) {
        match self {
            ResamplingAlgorithm::Identity => (times.to_vec(), values.to_vec()),
            ResamplingAlgorithm::Stride => gather(times, values, stride_indices(times.len(), target)),
            ResamplingAlgorithm::MinMax => {
                gather(times, values, min_max_indices(values, target))
            }
            ResamplingAlgorithm::Rms => rms_buckets(times, values, target),
            ResamplingAlgorithm::Lttb => gather(times, values, lttb_indices(times, values, target)),
        }
    }
}

impl fmt::Display for ResamplingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResamplingAlgorithm::Identity => "identity",
            ResamplingAlgorithm::Stride => "stride",
            ResamplingAlgorithm::MinMax => "min_max",
            ResamplingAlgorithm::Rms => "rms",
            ResamplingAlgorithm::Lttb => "lttb",
        };
        f.write_str(name)
    }
}

/// Ratio thresholds for algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResamplePolicy {
    /// Highest ratio reduced by plain stride decimation
    pub stride_threshold: f64,
    /// Highest ratio always reduced by min-max buckets
    pub minmax_threshold: f64,
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        Self {
            stride_threshold: 4.0,
            minmax_threshold: 64.0,
        }
    }
}

impl ResamplePolicy {
    pub fn new(stride_threshold: f64, minmax_threshold: f64) -> Self {
        Self {
            stride_threshold,
            minmax_threshold,
        }
    }

    /// Thresholds must be finite, at least 1 and ordered
    pub fn is_valid(&self) -> bool {
        self.stride_threshold.is_finite()
            && self.minmax_threshold.is_finite()
            && self.stride_threshold >= 1.0
            && self.stride_threshold <= self.minmax_threshold
    }
}

/// Pick the reduction for `available` samples and a budget of `max_points`
pub fn select_algorithm(
    available: usize,
    max_points: usize,
    policy: &ResamplePolicy,
    class: SignalClass,
) -> ResamplingAlgorithm {
    if available <= max_points {
        return ResamplingAlgorithm::Identity;
    }
    let ratio = available as f64 / max_points as f64;
    if ratio <= policy.stride_threshold {
        ResamplingAlgorithm::Stride
    } else if ratio <= policy.minmax_threshold {
        ResamplingAlgorithm::MinMax
    } else {
        match class {
            SignalClass::Spiky => ResamplingAlgorithm::MinMax,
            SignalClass::Noisy => ResamplingAlgorithm::Rms,
            SignalClass::Smooth => ResamplingAlgorithm::Lttb,
        }
    }
}

/// A reduced channel, stored column-wise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResampledSeries {
    pub channel_id: String,
    pub algorithm: ResamplingAlgorithm,
    /// Samples in the range that was reduced
    pub source_samples: usize,
    /// `source_samples / len()`; 1.0 when nothing was reduced
    pub decimation_ratio: f64,
    /// Whether the source range is a strict part of the channel
    pub subrange: bool,
    pub time_ms: Vec<f64>,
    pub values: Vec<f64>,
}

impl ResampledSeries {
    /// A series with no points
    pub fn empty(channel_id: impl Into<String>, subrange: bool) -> Self {
        Self {
            channel_id: channel_id.into(),
            algorithm: ResamplingAlgorithm::Identity,
            source_samples: 0,
            decimation_ratio: 1.0,
            subrange,
            time_ms: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(time, value)` pairs
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.time_ms.iter().copied().zip(self.values.iter().copied())
    }

    /// Mark the series as covering part of a larger channel
    pub fn into_subrange(mut self) -> Self {
        self.subrange = true;
        self
    }
}

/// Reduce a buffer (optionally restricted to a time window) to at most
/// `max_points` points.
pub fn resample(
    buffer: &SampleBuffer,
    window: Option<&TimeWindow>,
    max_points: usize,
    policy: &ResamplePolicy,
    class: SignalClass,
) -> Result<ResampledSeries, ValidationError> {
    if max_points == 0 {
        return Err(ValidationError::MaxPoints {
            requested: max_points,
            limit: usize::MAX,
        });
    }
    let range = match window {
        Some(window) => {
            window.validate()?;
            locate_window(buffer, window)
        }
        None => crate::index::SampleIndexRange::new(0, buffer.len()),
    };
    let subrange = !range.is_full(buffer.len());
    if range.is_empty() {
        return Ok(ResampledSeries::empty(buffer.channel_id(), subrange));
    }

    let times = &buffer.times()[range.as_range()];
    let values = &buffer.values()[range.as_range()];
    let mut series = resample_slices(buffer.channel_id(), times, values, max_points, policy, class);
    series.subrange = subrange;
    Ok(series)
}

/// Reduce raw columns that are already restricted to the range of interest
pub fn resample_slices(
    channel_id: &str,
    times: &[f64],
    values: &[f64],
    max_points: usize,
    policy: &ResamplePolicy,
    class: SignalClass,
) -> ResampledSeries {
    debug_assert_eq!(times.len(), values.len());
    let available = values.len();
    if available == 0 || max_points == 0 {
        return ResampledSeries::empty(channel_id, false);
    }
    let algorithm = select_algorithm(available, max_points, policy, class);
    let target = available.min(max_points);
    let (time_ms, out) = algorithm.reduce(times, values, target);

    tracing::trace!(
        channel = channel_id,
        %algorithm,
        available,
        points = out.len(),
        "resampled channel"
    );

    ResampledSeries {
        channel_id: channel_id.to_string(),
        algorithm,
        source_samples: available,
        decimation_ratio: available as f64 / out.len().max(1) as f64,
        subrange: false,
        time_ms,
        values: out,
    }
}

fn gather(times: &[f64], values: &[f64], indices: Vec<usize>) -> (Vec<f64>, Vec<f64>) {
    indices.iter().map(|&i| (times[i], values[i])).unzip()
}

/// Bounds of bucket `k` of `buckets` equal parts of `start..end`
fn bucket(start: usize, end: usize, buckets: usize, k: usize) -> (usize, usize) {
    let len = end - start;
    (start + k * len / buckets, start + (k + 1) * len / buckets)
}

/// `target` evenly spaced indices, `floor(i * n / target)`
fn stride_indices(n: usize, target: usize) -> Vec<usize> {
    (0..target).map(|i| i * n / target).collect()
}

/// Two indices per bucket, the extremes of the bucket in time order.
///
/// With an odd target the final sample closes the series on its own.
fn min_max_indices(values: &[f64], target: usize) -> Vec<usize> {
    let n = values.len();
    if target == 1 {
        let peak = (0..n)
            .filter(|&i| !values[i].is_nan())
            .max_by(|&a, &b| values[a].total_cmp(&values[b]))
            .unwrap_or(0);
        return vec![peak];
    }

    let pairs = target / 2;
    let end = if target % 2 == 1 { n - 1 } else { n };
    let mut indices = Vec::with_capacity(target);
    for k in 0..pairs {
        let (lo, hi) = bucket(0, end, pairs, k);
        let mut min_idx: Option<usize> = None;
        let mut max_idx: Option<usize> = None;
        for i in lo..hi {
            let v = values[i];
            if v.is_nan() {
                continue;
            }
            if min_idx.map_or(true, |m| v < values[m]) {
                min_idx = Some(i);
            }
            if max_idx.map_or(true, |m| v > values[m]) {
                max_idx = Some(i);
            }
        }
        let (a, b) = match (min_idx, max_idx) {
            (Some(a), Some(b)) if a != b => (a, b),
            // a single distinct value: pair it with a bucket edge
            (Some(a), Some(_)) if a == lo => (a, hi - 1),
            (Some(a), Some(_)) => (lo, a),
            _ => (lo, hi - 1),
        };
        indices.push(a.min(b));
        indices.push(a.max(b));
    }
    if target % 2 == 1 {
        indices.push(n - 1);
    }
    indices
}

/// One RMS point per bucket, timed at the bucket midpoint; `NaN` samples
/// are skipped and an all-`NaN` bucket yields `NaN`.
fn rms_buckets(times: &[f64], values: &[f64], target: usize) -> (Vec<f64>, Vec<f64>) {
    let n = values.len();
    let mut time_ms = Vec::with_capacity(target);
    let mut out = Vec::with_capacity(target);
    for k in 0..target {
        let (lo, hi) = bucket(0, n, target, k);
        let (sum_sq, count) = values[lo..hi]
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, c), &v| (s + v * v, c + 1));
        time_ms.push((times[lo] + times[hi - 1]) / 2.0);
        out.push(if count == 0 {
            f64::NAN
        } else {
            (sum_sq / count as f64).sqrt()
        });
    }
    (time_ms, out)
}

/// Largest-triangle-three-buckets selection. The first and last samples are
/// always kept; every inner bucket contributes the sample forming the largest
/// triangle with the previous pick and the average of the next bucket.
fn lttb_indices(times: &[f64], values: &[f64], target: usize) -> Vec<usize> {
    let n = values.len();
    match target {
        1 => return vec![0],
        2 => return vec![0, n - 1],
        _ => {}
    }

    let every = (n - 2) as f64 / (target - 2) as f64;
    let mut indices = Vec::with_capacity(target);
    indices.push(0);
    // triangles are anchored on the last pick that holds data
    let mut a = values.iter().position(|v| !v.is_nan()).unwrap_or(0);

    for i in 0..target - 2 {
        let avg_start = ((i + 1) as f64 * every) as usize + 1;
        let avg_end = (((i + 2) as f64 * every) as usize + 1).min(n);
        let (mut avg_x, mut avg_y, mut count) = (0.0, 0.0, 0usize);
        for j in avg_start..avg_end {
            if !values[j].is_nan() {
                avg_x += times[j];
                avg_y += values[j];
                count += 1;
            }
        }
        if count > 0 {
            avg_x /= count as f64;
            avg_y /= count as f64;
        } else {
            avg_x = times[avg_end - 1];
            avg_y = values[a];
        }

        let range_start = (i as f64 * every) as usize + 1;
        let range_end = ((i + 1) as f64 * every) as usize + 1;
        let (ax, ay) = (times[a], values[a]);
        let mut picked = range_start;
        let mut max_area = -1.0;
        for j in range_start..range_end {
            if values[j].is_nan() {
                continue;
            }
            let area = ((ax - avg_x) * (values[j] - ay) - (ax - times[j]) * (avg_y - ay)).abs();
            if area > max_area {
                max_area = area;
                picked = j;
            }
        }
        indices.push(picked);
        if !values[picked].is_nan() {
            a = picked;
        }
    }

    indices.push(n - 1);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> SampleBuffer {
        SampleBuffer::uniform("ramp", 0.0, 1.0, (0..n).map(|i| i as f64).collect())
    }

    fn noise(n: usize) -> SampleBuffer {
        let values = (0..n)
            .map(|i| ((i as f64 * 12.9898).sin() * 43758.5453).fract())
            .collect();
        SampleBuffer::uniform("noise", 0.0, 1.0, values)
    }

    fn policy() -> ResamplePolicy {
        ResamplePolicy::default()
    }

    #[test]
    fn test_selection_by_ratio() {
        let p = policy();
        let spiky = SignalClass::Spiky;
        assert_eq!(select_algorithm(100, 100, &p, spiky), ResamplingAlgorithm::Identity);
        assert_eq!(select_algorithm(400, 100, &p, spiky), ResamplingAlgorithm::Stride);
        assert_eq!(select_algorithm(401, 100, &p, spiky), ResamplingAlgorithm::MinMax);
        assert_eq!(select_algorithm(6400, 100, &p, spiky), ResamplingAlgorithm::MinMax);
        assert_eq!(select_algorithm(10_000, 100, &p, spiky), ResamplingAlgorithm::MinMax);
        assert_eq!(
            select_algorithm(10_000, 100, &p, SignalClass::Noisy),
            ResamplingAlgorithm::Rms
        );
        assert_eq!(
            select_algorithm(10_000, 100, &p, SignalClass::Smooth),
            ResamplingAlgorithm::Lttb
        );
    }

    #[test]
    fn test_identity_below_budget() {
        let buffer = noise(50);
        let series = resample(&buffer, None, 100, &policy(), SignalClass::Spiky).unwrap();
        assert_eq!(series.algorithm, ResamplingAlgorithm::Identity);
        assert_eq!(series.values, buffer.values());
        assert_eq!(series.time_ms, buffer.times());
        assert_eq!(series.decimation_ratio, 1.0);
        assert!(!series.subrange);
    }

    #[test]
    fn test_budget_is_exact_for_every_algorithm() {
        for class in [SignalClass::Spiky, SignalClass::Noisy, SignalClass::Smooth] {
            for (n, m) in [(1000, 3), (1000, 7), (1000, 100), (1001, 250), (10_000, 99), (5, 4), (3, 2), (9, 1)] {
                let series = resample(&noise(n), None, m, &policy(), class).unwrap();
                assert_eq!(series.len(), m, "n={n} m={m} {class:?} {}", series.algorithm);
                assert!(series.time_ms.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }

    #[test]
    fn test_min_max_keeps_global_extremes() {
        let mut values: Vec<f64> = (0..10_000).map(|i| (i as f64 * 0.01).sin()).collect();
        values[5000] = 250.0;
        values[7321] = -99.0;
        let buffer = SampleBuffer::uniform("current", 0.0, 1.0, values);
        for m in [2, 3, 10, 100, 101, 1000] {
            let series = resample(&buffer, None, m, &policy(), SignalClass::Spiky).unwrap();
            assert!(series.values.contains(&250.0), "max dropped at m={m}");
            if m > 1 {
                assert!(series.values.contains(&-99.0), "min dropped at m={m}");
            }
        }
    }

    #[test]
    fn test_min_max_handles_no_data() {
        let mut values = vec![f64::NAN; 100];
        values[40] = 1.0;
        let indices = min_max_indices(&values, 4);
        assert_eq!(indices.len(), 4);
        assert!(indices.contains(&40));
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_stride_indices() {
        assert_eq!(stride_indices(10, 4), vec![0, 2, 5, 7]);
        assert_eq!(stride_indices(6, 3), vec![0, 2, 4]);
    }

    #[test]
    fn test_rms_buckets() {
        let values: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 2.0 } else { -2.0 }).collect();
        let times: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let (t, v) = rms_buckets(&times, &values, 10);
        assert_eq!(v, vec![2.0; 10]);
        assert_eq!(t[0], 4.5);
        assert_eq!(t[9], 94.5);
    }

    #[test]
    fn test_lttb_leading_gap_keeps_first_bucket_peak() {
        let times: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut values = vec![0.0; 100];
        values[0] = f64::NAN;
        values[5] = 100.0;
        let indices = lttb_indices(&times, &values, 10);
        assert_eq!(indices.len(), 10);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[1], 5);
    }

    #[test]
    fn test_lttb_keeps_endpoints_and_peak() {
        let mut values: Vec<f64> = (0..1000).map(|i| i as f64 * 0.001).collect();
        values[500] = 10.0;
        let times: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let indices = lttb_indices(&times, &values, 20);
        assert_eq!(indices.len(), 20);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[19], 999);
        assert!(indices.contains(&500));
    }

    #[test]
    fn test_window_restricts_range() {
        let buffer = ramp(1000);
        let window = TimeWindow::between(100.0, 199.0);
        let series = resample(&buffer, Some(&window), 1000, &policy(), SignalClass::Spiky).unwrap();
        assert_eq!(series.len(), 100);
        assert_eq!(series.time_ms[0], 100.0);
        assert!(series.subrange);
    }

    #[test]
    fn test_window_outside_span_is_empty() {
        let buffer = ramp(1000);
        let window = TimeWindow::between(2000.0, 3000.0);
        let series = resample(&buffer, Some(&window), 100, &policy(), SignalClass::Spiky).unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = resample(&ramp(10), None, 0, &policy(), SignalClass::Spiky).unwrap_err();
        assert!(matches!(err, ValidationError::MaxPoints { requested: 0, .. }));
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = SampleBuffer::uniform("empty", 0.0, 1.0, Vec::new());
        let series = resample(&buffer, None, 10, &policy(), SignalClass::Spiky).unwrap();
        assert!(series.is_empty());
        assert_eq!(series.source_samples, 0);
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy().is_valid());
        assert!(!ResamplePolicy::new(10.0, 2.0).is_valid());
        assert!(!ResamplePolicy::new(0.5, 2.0).is_valid());
    }

    #[test]
    fn test_series_serializes_camel_case() {
        let series = resample(&ramp(4), None, 10, &policy(), SignalClass::Spiky).unwrap();
        let json = serde_json::to_value(&series).unwrap();
        assert_eq!(json["algorithm"], "identity");
        assert_eq!(json["sourceSamples"], 4);
        assert_eq!(json["timeMs"][3], 3.0);
    }
}
