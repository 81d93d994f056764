use ndarray::Array2;

use crate::error::{PipelineError, PipelineResult};

// ---------------------------------------------------------------------------
// Frame – one camera image
// ---------------------------------------------------------------------------

/// A single-channel 8-bit camera frame, indexed `[row, col]` (i.e. `[y, x]`).
pub type Frame = Array2<u8>;

/// Integer pixel location, `x` along columns and `y` along rows.
///
/// Signed so that user-supplied centers may lie outside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelPoint {
    pub x: i64,
    pub y: i64,
}

impl PixelPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// One camera acquisition tick, appended to the intensity series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensitySample {
    /// Seconds since the series was last cleared.
    pub time: f64,
    /// Mean pixel value under the ROI.
    pub intensity: f64,
    /// ROI center used for this frame.
    pub center: PixelPoint,
}

// ---------------------------------------------------------------------------
// SpectralFrame – one spectrometer reading
// ---------------------------------------------------------------------------

/// A spectrum: ascending wavelengths (nm) and the matching intensities.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    pub wavelengths: Vec<f64>,
    pub intensities: Vec<f64>,
}

impl SpectralFrame {
    /// Build a frame, rejecting axes of different lengths.
    pub fn new(wavelengths: Vec<f64>, intensities: Vec<f64>) -> PipelineResult<Self> {
        if wavelengths.len() != intensities.len() {
            return Err(PipelineError::LengthMismatch {
                expected: wavelengths.len(),
                actual: intensities.len(),
            });
        }
        Ok(Self {
            wavelengths,
            intensities,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }
}

/// A spectrum read back from a recording, with its optional annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpectrum {
    pub frame: SpectralFrame,
    /// Acquisition time in seconds, if the recording carried one.
    pub time: Option<f64>,
    /// Comment attached to this tick, if any.
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Annotated series
// ---------------------------------------------------------------------------

/// A time series with one comment per observation (`""` means no comment).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotatedSeries {
    pub time: Vec<f64>,
    pub values: Vec<f64>,
    pub comments: Vec<String>,
}

impl AnnotatedSeries {
    /// Assemble a series from parallel columns of equal length.
    pub fn from_columns(
        time: Vec<f64>,
        values: Vec<f64>,
        comments: Vec<String>,
    ) -> PipelineResult<Self> {
        for len in [values.len(), comments.len()] {
            if len != time.len() {
                return Err(PipelineError::LengthMismatch {
                    expected: time.len(),
                    actual: len,
                });
            }
        }
        Ok(Self {
            time,
            values,
            comments,
        })
    }

    pub fn push(&mut self, time: f64, value: f64, comment: impl Into<String>) {
        self.time.push(time);
        self.values.push(value);
        self.comments.push(comment.into());
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// One spectrometer tick after tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralSample {
    pub time: f64,
    /// Wavelength of the normalized minimum inside the band.
    pub min_wavelength: f64,
    /// Weighted centroid (equals `min_wavelength` until the window is fixed).
    pub centroid: f64,
    pub comment: String,
}

/// Append-only record of tracked spectral samples.
///
/// Columns are stored separately so that the minimum and centroid traces
/// can be handed to the fitter and shift computer as plain slices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectralSeries {
    pub time: Vec<f64>,
    pub minima: Vec<f64>,
    pub centroids: Vec<f64>,
    pub comments: Vec<String>,
}

impl SpectralSeries {
    pub fn push(&mut self, sample: SpectralSample) {
        self.time.push(sample.time);
        self.minima.push(sample.min_wavelength);
        self.centroids.push(sample.centroid);
        self.comments.push(sample.comment);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// The minimum-wavelength trace with its comments.
    pub fn minima_series(&self) -> AnnotatedSeries {
        AnnotatedSeries {
            time: self.time.clone(),
            values: self.minima.clone(),
            comments: self.comments.clone(),
        }
    }

    /// The centroid trace with its comments.
    pub fn centroid_series(&self) -> AnnotatedSeries {
        AnnotatedSeries {
            time: self.time.clone(),
            values: self.centroids.clone(),
            comments: self.comments.clone(),
        }
    }
}
