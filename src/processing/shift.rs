use log::{debug, warn};

use super::smoothing::{moving_average, window_ending_before};
use crate::error::{PipelineError, PipelineResult};

/// Default label marking the start of the measured step.
pub const DEFAULT_MARKER_A: &str = "GFAP";
/// Default label marking the end of the measured step.
pub const DEFAULT_MARKER_B: &str = "STOP";

/// Position of the first comment equal to `marker`.
pub fn find_marker(comments: &[String], marker: &str) -> PipelineResult<usize> {
    comments
        .iter()
        .position(|c| c == marker)
        .ok_or_else(|| PipelineError::MarkerNotFound(marker.to_string()))
}

/// Smoothed value just before each marker, `b − a`.
///
/// Each marker is read from the moving average whose window ends on the
/// sample immediately preceding the marker, so the reading is not affected
/// by anything at or after the marker itself.  Fails with
/// [`PipelineError::MarkerNotFound`] or [`PipelineError::IndexOutOfRange`].
pub fn try_compute_shift(
    values: &[f64],
    comments: &[String],
    window: usize,
    marker_a: &str,
    marker_b: &str,
) -> PipelineResult<f64> {
    let smoothed = moving_average(values, window);
    let index_a = find_marker(comments, marker_a)?;
    let index_b = find_marker(comments, marker_b)?;

    let lookup = |raw: usize| -> PipelineResult<f64> {
        window_ending_before(raw, window)
            .and_then(|j| smoothed.get(j).copied())
            .ok_or(PipelineError::IndexOutOfRange {
                index: raw as isize - window as isize,
                len: smoothed.len(),
            })
    };
    let shift = lookup(index_b)? - lookup(index_a)?;
    debug!("Shift between '{marker_a}' (#{index_a}) and '{marker_b}' (#{index_b}): {shift}");
    Ok(shift)
}

/// Like [`try_compute_shift`], but reports failures as `0.0` with a warning.
///
/// The time column is accepted for symmetry with the stored series; the
/// shift itself is computed on sample indices.
pub fn compute_shift(
    _time: &[f64],
    values: &[f64],
    comments: &[String],
    window: usize,
    marker_a: &str,
    marker_b: &str,
) -> f64 {
    match try_compute_shift(values, comments, window, marker_a, marker_b) {
        Ok(shift) => shift,
        Err(err) => {
            warn!("{}", shift_warning(&err));
            0.0
        }
    }
}

fn shift_warning(err: &PipelineError) -> String {
    match err {
        PipelineError::IndexOutOfRange { .. } => format!(
            "Error computing shift: {err} (marker too close to the series edge or window too wide)"
        ),
        other => format!("Error computing shift: {other}"),
    }
}
