// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Sweep-range descriptors and comparison operators for pulse-verify loops.
//!
//! Programming recipes describe their voltage and pulse-width axes in one of
//! several interchangeable forms: a single value, an explicit point list, or a
//! start/stop/step (or start/stop/steps) range. [`SweepParameter`] accepts all
//! of them from JSON settings and expands them into concrete point lists,
//! linearly spaced for voltages and log10-spaced for pulse widths.

use serde::Deserialize;

/// A sweep axis as it appears in a settings file.
///
/// Deserializes from a bare number, a list of numbers, a
/// `{"start": x0, "stop": x1, "step": dx}` object, or a
/// `{"start": x0, "stop": x1, "steps": n}` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SweepParameter {
    /// A single fixed value.
    Single(f64),
    /// An explicit list of points, used as-is.
    List(Vec<f64>),
    /// An inclusive start/stop range with a step size.
    ///
    /// For linear expansion `step` is the additive increment; for log10
    /// expansion it is the multiplicative ratio between consecutive points
    /// (e.g. `{start: 1, stop: 1000, step: 10}` → `[1, 10, 100, 1000]`).
    Range { start: f64, stop: f64, step: f64 },
    /// An inclusive start/stop range with an explicit point count.
    Steps { start: f64, stop: f64, steps: usize },
}

impl SweepParameter {
    /// Expand into linearly spaced points. The endpoint is included.
    pub fn linear_points(&self) -> Vec<f64> {
        match self {
            SweepParameter::Single(v) => vec![*v],
            SweepParameter::List(vs) => vs.clone(),
            SweepParameter::Range { start, stop, step } => {
                // round() absorbs float error so e.g. 0.2999.. still counts
                // as a full step; abs() tolerates stop < start.
                let n = 1 + ((stop - start) / step).round().abs() as usize;
                linspace(*start, *stop, n)
            }
            SweepParameter::Steps { start, stop, steps } => linspace(*start, *stop, *steps),
        }
    }

    /// Expand into log10-spaced points. The endpoint is included.
    ///
    /// All points must be positive for the range forms.
    pub fn log10_points(&self) -> Vec<f64> {
        match self {
            SweepParameter::Single(v) => vec![*v],
            SweepParameter::List(vs) => vs.clone(),
            SweepParameter::Range { start, stop, step } => {
                let l0 = start.log10();
                let l1 = stop.log10();
                let n = 1 + ((l1 - l0) / step.log10()).round().abs() as usize;
                logspace(l0, l1, n)
            }
            SweepParameter::Steps { start, stop, steps } => {
                logspace(start.log10(), stop.log10(), *steps)
            }
        }
    }

    /// The single fixed value of this axis (the first point).
    ///
    /// Used for the voltage that is held constant during a sweep, e.g. VSL
    /// during a SET search.
    pub fn fixed(&self) -> f64 {
        match self {
            SweepParameter::Single(v) => *v,
            SweepParameter::List(vs) => vs.first().copied().unwrap_or(0.0),
            SweepParameter::Range { start, .. } | SweepParameter::Steps { start, .. } => *start,
        }
    }
}

/// `n` evenly spaced points over `[start, stop]`, endpoint included.
fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let dx = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + dx * i as f64).collect()
        }
    }
}

/// `n` log10-spaced points between `10^l0` and `10^l1`, endpoint included.
fn logspace(l0: f64, l1: f64, n: usize) -> Vec<f64> {
    linspace(l0, l1, n).into_iter().map(|e| 10f64.powf(e)).collect()
}

/// Comparison operator for convergence checks.
///
/// Pulse-verify loops are direction-agnostic: a SET search checks
/// `RES <= target` while a RESET search checks `RES >= target`. Carrying the
/// operator as a value lets the same sweep code serve both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equals,
    Less,
    LessOrEquals,
    Greater,
    GreaterOrEquals,
}

impl Comparison {
    /// Evaluate `a <op> b`.
    pub fn holds(&self, a: f64, b: f64) -> bool {
        match self {
            Comparison::Equals => a == b,
            Comparison::Less => a < b,
            Comparison::LessOrEquals => a <= b,
            Comparison::Greater => a > b,
            Comparison::GreaterOrEquals => a >= b,
        }
    }
}
