use log::debug;

use super::fit::{fit_all, FittedCurve, SegmentedFit, UnderdeterminedPolicy};
use super::smoothing::{effective_window, leading_offset, moving_average};
use crate::error::{PipelineError, PipelineResult};

/// Title given to the segment that opens the series.
pub const FIRST_SEGMENT_TITLE: &str = "Start";

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// A contiguous run of samples between two labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Label that opened the segment (`"Start"` for the first one).
    pub title: String,
    pub time: Vec<f64>,
    pub values: Vec<f64>,
}

/// Split a series on its labels.
///
/// A non-empty label at index `i` closes the current segment after sample
/// `i` and opens the next one under that label.  The trailing run after the
/// last label becomes the final segment when it has samples.
pub fn split_segments(time: &[f64], values: &[f64], labels: &[String]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = Segment {
        title: FIRST_SEGMENT_TITLE.to_string(),
        time: Vec::new(),
        values: Vec::new(),
    };

    for (i, (&t, &v)) in time.iter().zip(values).enumerate() {
        current.time.push(t);
        current.values.push(v);
        match labels.get(i) {
            Some(label) if !label.is_empty() => {
                let next = Segment {
                    title: label.clone(),
                    time: Vec::new(),
                    values: Vec::new(),
                };
                segments.push(std::mem::replace(&mut current, next));
            }
            _ => {}
        }
    }
    if !current.time.is_empty() {
        segments.push(current);
    }
    segments
}

// ---------------------------------------------------------------------------
// Post-processing
// ---------------------------------------------------------------------------

/// Everything produced by [`post_process`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessed {
    /// Moving-average window actually used.
    pub window: usize,
    pub segments: Vec<Segment>,
    pub fit: SegmentedFit,
}

impl PostProcessed {
    pub fn curve(&self) -> &FittedCurve {
        &self.fit.curve
    }
}

/// Smooth, segment on labels and fit a series.
///
/// The moving-average window is clamped to 1 (with a warning) when it does
/// not fit the series.  The time axis loses the same leading samples as the
/// smoothed values.  Label `i` is matched against smoothed sample `i`.
pub fn post_process(
    time: &[f64],
    values: &[f64],
    labels: &[String],
    moving_average_window: usize,
    policy: UnderdeterminedPolicy,
) -> PipelineResult<PostProcessed> {
    for len in [time.len(), labels.len()] {
        if len != values.len() {
            return Err(PipelineError::LengthMismatch {
                expected: values.len(),
                actual: len,
            });
        }
    }

    let window = effective_window(moving_average_window, values.len());
    let smoothed = moving_average(values, window);
    let smoothed_time = &time[leading_offset(window).min(time.len())..];
    debug!(
        "Post-processing {} samples with window {window} ({} smoothed)",
        values.len(),
        smoothed.len()
    );

    let segments = split_segments(smoothed_time, &smoothed, labels);
    let time_segments: Vec<Vec<f64>> = segments.iter().map(|s| s.time.clone()).collect();
    let value_segments: Vec<Vec<f64>> = segments.iter().map(|s| s.values.clone()).collect();
    let fit = fit_all(&time_segments, &value_segments, policy)?;

    Ok(PostProcessed {
        window,
        segments,
        fit,
    })
}
