//! Derived channel formulas
//!
//! Each formula is a pure, stateless, sample-by-sample function over raw
//! channel buffers that share one time base. Inputs must match exactly in
//! length; nothing is truncated or interpolated, so a derived channel is an
//! exact reconstruction or an error. The "no data" sentinel (`NaN`) propagates
//! through every formula.

use crate::error::CalcError;
use crate::types::SampleBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Formula used to compute a derived channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Formula {
    /// Elementwise product of all inputs (e.g. voltage x current = power)
    Product,
    /// Elementwise sum of all inputs
    Sum,
    /// `a - b`
    Difference,
    /// `sqrt(sum of squares)` over all inputs (e.g. 3-axis acceleration)
    Magnitude,
    /// `clamp(a - b, min, max)`
    ClampedDifference { min: f64, max: f64 },
}

impl Formula {
    /// Resolve a formula identifier; parameterised formulas take `params`
    pub fn from_id(id: &str, params: &[f64]) -> Result<Self, CalcError> {
        match id {
            "product" => Ok(Formula::Product),
            "sum" => Ok(Formula::Sum),
            "difference" => Ok(Formula::Difference),
            "magnitude" => Ok(Formula::Magnitude),
            "clamped_difference" => match params {
                [min, max] => Ok(Formula::ClampedDifference {
                    min: *min,
                    max: *max,
                }),
                _ => Err(CalcError::InvalidParameter(format!(
                    "clamped_difference takes [min, max], got {} values",
                    params.len()
                ))),
            },
            other => Err(CalcError::UnknownFormula(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Formula::Product => "product",
            Formula::Sum => "sum",
            Formula::Difference => "difference",
            Formula::Magnitude => "magnitude",
            Formula::ClampedDifference { .. } => "clamped_difference",
        }
    }

    fn check_arity(&self, inputs: usize) -> Result<(), CalcError> {
        let (ok, expected) = match self {
            Formula::Product | Formula::Sum => (inputs >= 2, "at least 2"),
            Formula::Magnitude => (inputs >= 1, "at least 1"),
            Formula::Difference | Formula::ClampedDifference { .. } => (inputs == 2, "exactly 2"),
        };
        if ok {
            Ok(())
        } else {
            Err(CalcError::Arity {
                formula: self.id(),
                expected,
                actual: inputs,
            })
        }
    }

    fn check_params(&self) -> Result<(), CalcError> {
        if let Formula::ClampedDifference { min, max } = self {
            // f64::clamp panics on these
            if min.is_nan() || max.is_nan() || min > max {
                return Err(CalcError::InvalidParameter(format!(
                    "clamp bounds [{}, {}] are not ordered",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Compute a derived channel from its inputs.
///
/// Fails closed: any mismatch aborts without producing output.
pub fn compute(
    formula: &Formula,
    channel_id: &str,
    inputs: &[&SampleBuffer],
) -> Result<SampleBuffer, CalcError> {
    formula.check_arity(inputs.len())?;
    formula.check_params()?;

    let first = inputs[0];
    for input in &inputs[1..] {
        if input.len() != first.len() {
            return Err(CalcError::LengthMismatch {
                expected: first.len(),
                actual: input.len(),
            });
        }
        if !input.shares_time_base(first) {
            return Err(CalcError::TimeBaseMismatch);
        }
    }

    let len = first.len();
    let values: Vec<f64> = match *formula {
        Formula::Product => fold(inputs, len, 1.0, |acc, v| acc * v),
        Formula::Sum => fold(inputs, len, 0.0, |acc, v| acc + v),
        Formula::Magnitude => fold(inputs, len, 0.0, |acc, v| acc + v * v)
            .into_iter()
            .map(f64::sqrt)
            .collect(),
        Formula::Difference => zip2(inputs, |a, b| a - b),
        Formula::ClampedDifference { min, max } => zip2(inputs, |a, b| (a - b).clamp(min, max)),
    };

    tracing::debug!(
        channel = channel_id,
        formula = formula.id(),
        inputs = inputs.len(),
        samples = len,
        "computed derived channel"
    );

    Ok(SampleBuffer::new(channel_id, Arc::clone(first.time_base()), values))
}

fn fold(inputs: &[&SampleBuffer], len: usize, init: f64, op: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let mut out = vec![init; len];
    for input in inputs {
        for (acc, &v) in out.iter_mut().zip(input.values()) {
            *acc = op(*acc, v);
        }
    }
    out
}

fn zip2(inputs: &[&SampleBuffer], op: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    inputs[0]
        .values()
        .iter()
        .zip(inputs[1].values())
        .map(|(&a, &b)| op(a, b))
        .collect()
}
