use thiserror::Error;

/// Result alias for the signal-processing core.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// PipelineError – everything the core can report to its caller
// ---------------------------------------------------------------------------

/// Errors raised by the extraction, fitting and tracking stages.
///
/// Only [`PipelineError::InvalidConfiguration`] is expected to abort a whole
/// operation.  Fit failures are absorbed inside the fitter and the shift
/// computer turns its own failures into a logged `0.0`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("nonlinear fit did not converge after {iterations} iterations")]
    FitDidNotConverge { iterations: usize },

    #[error("fit needs at least {required} points, got {points}")]
    FitUnderdetermined { points: usize, required: usize },

    #[error("marker '{0}' not found in comments")]
    MarkerNotFound(String),

    #[error("index {index} out of range for series of length {len}")]
    IndexOutOfRange { index: isize, len: usize },

    #[error("length mismatch: expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("no spectrum sample strictly inside the band ({min} nm, {max} nm)")]
    EmptyBand { min: f64, max: f64 },

    #[error("region of interest centered at ({x}, {y}) covers no pixel of the frame")]
    EmptyRoi { x: i64, y: i64 },
}

impl PipelineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration(msg.into())
    }
}
