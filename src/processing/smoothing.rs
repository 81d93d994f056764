//! Moving-average and Savitzky–Golay smoothing.
//!
//! The moving average uses "valid" convolution: an input of length `n`
//! smoothed with a window of `w` yields `n - w + 1` values, and output
//! sample `j` averages inputs `j ..= j + w - 1`.  Everything that maps
//! indices between raw and smoothed series goes through [`valid_len`],
//! [`leading_offset`] and [`window_ending_before`].

use log::warn;
use nalgebra::{DMatrix, DVector};

// ---------------------------------------------------------------------------
// Moving average ('valid' mode)
// ---------------------------------------------------------------------------

/// Output length of a 'valid' moving average, `None` when the window does
/// not fit in the input.
pub fn valid_len(input_len: usize, window: usize) -> Option<usize> {
    if window == 0 || window > input_len {
        None
    } else {
        Some(input_len - window + 1)
    }
}

/// Number of leading raw samples with no smoothed counterpart.
///
/// Smoothed sample `j` is aligned with the raw sample at `j + leading_offset`,
/// the last sample of its window.
pub fn leading_offset(window: usize) -> usize {
    window.saturating_sub(1)
}

/// Index of the smoothed sample whose window ends on the raw sample just
/// before `raw_index`, or `None` if no such window exists.
pub fn window_ending_before(raw_index: usize, window: usize) -> Option<usize> {
    // The window must end at raw_index - 1, so it starts at raw_index - window.
    raw_index.checked_sub(window)
}

/// Clamp a requested window to `1..=len`, warning when the request is unusable.
pub fn effective_window(requested: usize, len: usize) -> usize {
    if requested < 1 || requested > len {
        warn!("Invalid moving average size {requested} for {len} samples, using 1 instead");
        1
    } else {
        requested
    }
}

/// Uniform-kernel moving average in 'valid' mode.
///
/// Returns an empty vector when the window does not fit.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let Some(out_len) = valid_len(values.len(), window) else {
        return Vec::new();
    };
    let w = window as f64;
    let mut out = Vec::with_capacity(out_len);
    let mut sum: f64 = values[..window].iter().sum();
    out.push(sum / w);
    for j in 1..out_len {
        sum += values[j + window - 1] - values[j - 1];
        out.push(sum / w);
    }
    out
}

// ---------------------------------------------------------------------------
// Savitzky–Golay
// ---------------------------------------------------------------------------

/// Savitzky–Golay smoother with "nearest" edge handling.
#[derive(Debug, Clone, PartialEq)]
pub struct SavitzkyGolay {
    coefficients: Vec<f64>,
    half: usize,
}

impl SavitzkyGolay {
    /// Design a filter. Even windows are widened by one sample (a request of
    /// 100 runs as 101) since the weights are centered on one sample; the
    /// window is also widened if needed so that it exceeds `polyorder`.
    pub fn new(window: usize, polyorder: usize) -> Self {
        let mut window = window.max(polyorder + 1).max(1);
        if window % 2 == 0 {
            window += 1;
        }
        let half = window / 2;
        Self {
            coefficients: smoothing_coefficients(half, polyorder),
            half,
        }
    }

    pub fn window(&self) -> usize {
        2 * self.half + 1
    }

    /// Smooth `values`, repeating the edge samples outside the input.
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        if n == 0 {
            return Vec::new();
        }
        let half = self.half as isize;
        (0..n as isize)
            .map(|i| {
                self.coefficients
                    .iter()
                    .enumerate()
                    .map(|(k, c)| {
                        let idx = (i + k as isize - half).clamp(0, n as isize - 1);
                        c * values[idx as usize]
                    })
                    .sum()
            })
            .collect()
    }
}

/// Convolution weights that evaluate, at the window center, the least-squares
/// polynomial of degree `polyorder` through `2 * half + 1` samples.
fn smoothing_coefficients(half: usize, polyorder: usize) -> Vec<f64> {
    let m = polyorder + 1;
    let offsets: Vec<f64> = (-(half as isize)..=half as isize)
        .map(|k| k as f64)
        .collect();

    // Normal matrix AᵀA with A[k][p] = offset_k^p.
    let normal = DMatrix::from_fn(m, m, |p, q| {
        offsets.iter().map(|x| x.powi((p + q) as i32)).sum::<f64>()
    });

    // Row 0 of (AᵀA)⁻¹ is enough: solve (AᵀA) z = e₀ (the matrix is symmetric).
    let mut rhs = DVector::<f64>::zeros(m);
    rhs[0] = 1.0;
    let z = normal
        .lu()
        .solve(&rhs)
        .filter(|z| z.iter().all(|v| v.is_finite()))
        .unwrap_or_else(|| {
            let mut mean = DVector::zeros(m);
            mean[0] = 1.0 / offsets.len() as f64;
            mean
        });

    offsets
        .iter()
        .map(|x| z.iter().enumerate().map(|(p, zp)| zp * x.powi(p as i32)).sum())
        .collect()
}
