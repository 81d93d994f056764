//! Segment-wise exponential fitting with continuity between segments.
//!
//! Each segment is fitted to `a·exp(−b·(t − t₀)) + c` by weighted
//! Levenberg–Marquardt, with the first sample carrying a tiny uncertainty so
//! the curve passes through it.  When the solver does not converge the
//! segment falls back to a weighted straight line.  Segments after the first
//! are prefixed with an anchor sample taken from the previous segment's fitted
//! curve, which chains all fits into one continuous trace.

use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Uncertainty assigned to the first sample of a segment (all others use 1).
pub const PINNED_SIGMA: f64 = 1e-4;

/// Free parameters of the exponential model.
const EXPONENTIAL_PARAMS: usize = 3;
/// Free parameters of the linear model.
const LINEAR_PARAMS: usize = 2;

const MAX_ITERATIONS: usize = 400;
const STEP_TOLERANCE: f64 = 1e-10;
const MAX_DAMPING: f64 = 1e16;

// ---------------------------------------------------------------------------
// Fit models
// ---------------------------------------------------------------------------

/// Parameters of one fitted segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FitModel {
    /// `a·exp(−b·(t − t0)) + c`, with `t0` the first time of the fitted input.
    Exponential { a: f64, b: f64, c: f64, t0: f64 },
    /// `a·t + b`.
    Linear { a: f64, b: f64 },
}

impl FitModel {
    pub fn evaluate(&self, t: f64) -> f64 {
        match *self {
            FitModel::Exponential { a, b, c, t0 } => a * (-b * (t - t0)).exp() + c,
            FitModel::Linear { a, b } => a * t + b,
        }
    }

    pub fn is_exponential(&self) -> bool {
        matches!(self, FitModel::Exponential { .. })
    }
}

/// What `fit_all` does with a segment too short for the exponential model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnderdeterminedPolicy {
    /// Return [`PipelineError::FitUnderdetermined`] to the caller.
    Fail,
    /// Fit a line, or a constant when a single point is available.
    #[default]
    Degrade,
}

/// The fit of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFit {
    /// Position of the segment in the input.
    pub segment: usize,
    pub model: FitModel,
    /// Whether an anchor from the previous segment was prepended.
    pub anchored: bool,
}

/// A reconstructed curve: parallel time and value columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FittedCurve {
    pub time: Vec<f64>,
    pub values: Vec<f64>,
}

impl FittedCurve {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.time.iter().copied().zip(self.values.iter().copied())
    }
}

/// Result of [`fit_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentedFit {
    pub fits: Vec<SegmentFit>,
    pub curve: FittedCurve,
}

// ---------------------------------------------------------------------------
// Single segment
// ---------------------------------------------------------------------------

/// Fit one segment, pinned to its first sample.
///
/// Falls back to a line when the exponential solver does not converge.
/// Fewer than three samples is [`PipelineError::FitUnderdetermined`].
pub fn fit_segment(times: &[f64], values: &[f64]) -> PipelineResult<FitModel> {
    if times.len() != values.len() {
        return Err(PipelineError::LengthMismatch {
            expected: times.len(),
            actual: values.len(),
        });
    }
    if times.len() < EXPONENTIAL_PARAMS {
        return Err(PipelineError::FitUnderdetermined {
            points: times.len(),
            required: EXPONENTIAL_PARAMS,
        });
    }

    let sigma = pinned_sigma(times.len());
    match fit_exponential(times, values, &sigma) {
        Ok(model) => Ok(model),
        Err(err) => {
            debug!("Exponential fit failed ({err}), falling back to linear");
            fit_linear(times, values, &sigma)
        }
    }
}

fn pinned_sigma(n: usize) -> Vec<f64> {
    let mut sigma = vec![1.0; n];
    if let Some(first) = sigma.first_mut() {
        *first = PINNED_SIGMA;
    }
    sigma
}

/// Weighted least-squares line `a·t + b`.
pub fn fit_linear(times: &[f64], values: &[f64], sigma: &[f64]) -> PipelineResult<FitModel> {
    if times.len() < LINEAR_PARAMS {
        return Err(PipelineError::FitUnderdetermined {
            points: times.len(),
            required: LINEAR_PARAMS,
        });
    }
    let weights: Vec<f64> = sigma.iter().map(|s| 1.0 / (s * s)).collect();
    let total: f64 = weights.iter().sum();
    let t_mean = weights.iter().zip(times).map(|(w, t)| w * t).sum::<f64>() / total;
    let y_mean = weights.iter().zip(values).map(|(w, y)| w * y).sum::<f64>() / total;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for ((w, t), y) in weights.iter().zip(times).zip(values) {
        sxx += w * (t - t_mean) * (t - t_mean);
        sxy += w * (t - t_mean) * (y - y_mean);
    }
    if sxx <= f64::EPSILON * total * (t_mean.abs() + 1.0) {
        // All samples share one time: the slope is undefined.
        return Err(PipelineError::FitUnderdetermined {
            points: 1,
            required: LINEAR_PARAMS,
        });
    }
    let a = sxy / sxx;
    Ok(FitModel::Linear {
        a,
        b: y_mean - a * t_mean,
    })
}

/// Weighted Levenberg–Marquardt fit of `a·exp(−b·(t − t₀)) + c`.
pub fn fit_exponential(times: &[f64], values: &[f64], sigma: &[f64]) -> PipelineResult<FitModel> {
    let n = times.len();
    if n < EXPONENTIAL_PARAMS {
        return Err(PipelineError::FitUnderdetermined {
            points: n,
            required: EXPONENTIAL_PARAMS,
        });
    }
    let t0 = times[0];
    let sqrt_w: Vec<f64> = sigma.iter().map(|s| 1.0 / s).collect();

    let span = times[n - 1] - t0;
    let decay_guess = if span.abs() > f64::EPSILON {
        3.0 / span.abs()
    } else {
        1.0
    };
    let mut p = Vector3::new(values[0] - values[n - 1], decay_guess, values[n - 1]);

    let cost_of = |p: &Vector3<f64>| -> f64 {
        (0..n)
            .map(|i| {
                let r = sqrt_w[i] * (model_value(p, times[i] - t0) - values[i]);
                r * r
            })
            .sum()
    };

    let mut cost = cost_of(&p);
    if !cost.is_finite() {
        return Err(PipelineError::FitDidNotConverge { iterations: 0 });
    }
    let mut lambda = 1e-3;

    for iteration in 1..=MAX_ITERATIONS {
        // Normal equations JᵀJ δ = −Jᵀr on the weighted residuals.
        let mut jtj = Matrix3::<f64>::zeros();
        let mut jtr = Vector3::<f64>::zeros();
        for i in 0..n {
            let dt = times[i] - t0;
            let e = (-p[1] * dt).exp();
            let jac = Vector3::new(sqrt_w[i] * e, -sqrt_w[i] * p[0] * dt * e, sqrt_w[i]);
            let r = sqrt_w[i] * (p[0] * e + p[2] - values[i]);
            jtr += jac * r;
            jtj += jac * jac.transpose();
        }

        loop {
            let mut damped = jtj;
            for k in 0..EXPONENTIAL_PARAMS {
                let diag = jtj[(k, k)];
                damped[(k, k)] = if diag > 0.0 { diag * (1.0 + lambda) } else { lambda };
            }
            let step = damped
                .lu()
                .solve(&-jtr)
                .filter(|step| step.iter().all(|v| v.is_finite()));
            let Some(step) = step else {
                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    return Err(PipelineError::FitDidNotConverge { iterations: iteration });
                }
                continue;
            };

            if step.norm() <= STEP_TOLERANCE * (p.norm() + STEP_TOLERANCE) {
                return finish(&p, t0, iteration);
            }

            let candidate = p + step;
            let candidate_cost = cost_of(&candidate);
            if candidate_cost.is_finite() && candidate_cost < cost {
                let improvement = cost - candidate_cost;
                p = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement <= 1e-15 * cost || cost <= 1e-28 {
                    return finish(&p, t0, iteration);
                }
                break;
            }

            lambda *= 10.0;
            if lambda > MAX_DAMPING {
                return Err(PipelineError::FitDidNotConverge { iterations: iteration });
            }
        }
    }

    Err(PipelineError::FitDidNotConverge {
        iterations: MAX_ITERATIONS,
    })
}

fn model_value(p: &Vector3<f64>, dt: f64) -> f64 {
    p[0] * (-p[1] * dt).exp() + p[2]
}

fn finish(p: &Vector3<f64>, t0: f64, iterations: usize) -> PipelineResult<FitModel> {
    if p.iter().all(|v| v.is_finite()) {
        Ok(FitModel::Exponential {
            a: p[0],
            b: p[1],
            c: p[2],
            t0,
        })
    } else {
        Err(PipelineError::FitDidNotConverge { iterations })
    }
}

// ---------------------------------------------------------------------------
// All segments
// ---------------------------------------------------------------------------

/// Fit every segment, chaining each to the previous fitted curve.
///
/// Segment `i > 0` is fitted with an extra leading sample at the previous
/// segment's last time, valued from the previous fit.  The returned curve
/// holds each fit evaluated at its own segment's times (anchors excluded).
/// Empty segments are skipped.
pub fn fit_all(
    time_segments: &[Vec<f64>],
    value_segments: &[Vec<f64>],
    policy: UnderdeterminedPolicy,
) -> PipelineResult<SegmentedFit> {
    if time_segments.len() != value_segments.len() {
        return Err(PipelineError::LengthMismatch {
            expected: time_segments.len(),
            actual: value_segments.len(),
        });
    }

    let mut out = SegmentedFit::default();
    let mut previous: Option<(f64, FitModel)> = None;

    for (index, (times, values)) in time_segments.iter().zip(value_segments).enumerate() {
        if times.len() != values.len() {
            return Err(PipelineError::LengthMismatch {
                expected: times.len(),
                actual: values.len(),
            });
        }
        let Some(&last_time) = times.last() else {
            debug!("Segment {index} is empty, skipping");
            continue;
        };

        let (fit_times, fit_values) = match previous {
            Some((anchor_time, model)) => {
                let mut t = Vec::with_capacity(times.len() + 1);
                let mut v = Vec::with_capacity(values.len() + 1);
                t.push(anchor_time);
                v.push(model.evaluate(anchor_time));
                t.extend_from_slice(times);
                v.extend_from_slice(values);
                (t, v)
            }
            None => (times.clone(), values.clone()),
        };

        let model = match fit_segment(&fit_times, &fit_values) {
            Ok(model) => model,
            Err(err @ PipelineError::FitUnderdetermined { .. }) => match policy {
                UnderdeterminedPolicy::Fail => return Err(err),
                UnderdeterminedPolicy::Degrade => degrade(index, &fit_times, &fit_values, &err),
            },
            Err(err) => return Err(err),
        };

        out.curve.time.extend_from_slice(times);
        out.curve
            .values
            .extend(times.iter().map(|&t| model.evaluate(t)));
        out.fits.push(SegmentFit {
            segment: index,
            model,
            anchored: previous.is_some(),
        });
        previous = Some((last_time, model));
    }

    Ok(out)
}

/// Linear, then constant, replacement for a segment too short to fit.
fn degrade(index: usize, times: &[f64], values: &[f64], cause: &PipelineError) -> FitModel {
    if let Ok(model) = fit_linear(times, values, &pinned_sigma(times.len())) {
        warn!("Segment {index}: {cause}; using a linear fit");
        return model;
    }
    // A single usable value (or several at one instant): hold the pinned sample.
    let level = values.first().copied().unwrap_or(0.0);
    warn!("Segment {index}: {cause}; holding constant value {level}");
    FitModel::Linear { a: 0.0, b: level }
}
