//! Absorption-minimum and centroid tracking on spectrometer readings.
//!
//! The tracker owns the session-long state of the spectral pipeline: the
//! dark and flat field accumulators, the normalization gain and the
//! centroid window.  `track` itself only reads that state.

use std::ops::Range;

use log::{debug, info};

use crate::data::model::SpectralFrame;
use crate::error::{PipelineError, PipelineResult};

/// Default number of spectra averaged into a dark or flat field.
pub const DEFAULT_FIELD_FRAMES: usize = 50;
/// Default centroid half-width, in detector pixels.
pub const DEFAULT_CENTROID_HALF_WIDTH: usize = 250;

// ---------------------------------------------------------------------------
// Wavelength band
// ---------------------------------------------------------------------------

/// Open wavelength interval `(min, max)` in nm; samples on a bound are excluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    min: f64,
    max: f64,
}

impl Band {
    pub fn new(min: f64, max: f64) -> PipelineResult<Self> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(PipelineError::invalid(format!(
                "wavelength band ({min}, {max}) is empty or not finite"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn contains(&self, wavelength: f64) -> bool {
        wavelength > self.min && wavelength < self.max
    }
}

// ---------------------------------------------------------------------------
// Field accumulation
// ---------------------------------------------------------------------------

/// Progress reported after feeding one spectrum to an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationStatus {
    InProgress { count: usize, target: usize },
    Completed,
}

/// Running average of a fixed number of spectra.
///
/// The finished average stays in use while a new cycle accumulates, and is
/// replaced when that cycle completes.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAccumulator {
    target: usize,
    sum: Vec<f64>,
    count: usize,
    value: Option<Vec<f64>>,
}

impl FieldAccumulator {
    pub fn new(target: usize) -> Self {
        Self {
            target: target.max(1),
            sum: Vec::new(),
            count: 0,
            value: None,
        }
    }

    /// Add one spectrum to the running sum.
    pub fn accumulate(&mut self, intensities: &[f64]) -> PipelineResult<AccumulationStatus> {
        if self.count == 0 {
            self.sum = vec![0.0; intensities.len()];
        } else if self.sum.len() != intensities.len() {
            return Err(PipelineError::LengthMismatch {
                expected: self.sum.len(),
                actual: intensities.len(),
            });
        }
        for (s, v) in self.sum.iter_mut().zip(intensities) {
            *s += v;
        }
        self.count += 1;

        if self.count < self.target {
            return Ok(AccumulationStatus::InProgress {
                count: self.count,
                target: self.target,
            });
        }
        let n = self.count as f64;
        self.value = Some(std::mem::take(&mut self.sum).into_iter().map(|s| s / n).collect());
        self.count = 0;
        Ok(AccumulationStatus::Completed)
    }

    /// Drop the partial sum so the next spectrum starts a new cycle.
    pub fn reset(&mut self) {
        self.sum.clear();
        self.count = 0;
    }

    /// Forget both the partial sum and the finished field.
    pub fn clear(&mut self) {
        self.reset();
        self.value = None;
    }

    pub fn value(&self) -> Option<&[f64]> {
        self.value.as_deref()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

// ---------------------------------------------------------------------------
// Centroid window
// ---------------------------------------------------------------------------

/// Half-open index range `[start, end)` over the full spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentroidWindow {
    pub start: usize,
    pub end: usize,
}

impl CentroidWindow {
    /// `[index − half_width, index + half_width)` with each bound clamped to
    /// the spectrum on its own; the window is not re-centered.
    pub fn around(index: usize, half_width: usize, len: usize) -> Self {
        Self {
            start: index.saturating_sub(half_width),
            end: index.saturating_add(half_width).min(len),
        }
    }

    pub fn range(&self, len: usize) -> Range<usize> {
        let end = self.end.min(len);
        self.start.min(end)..end
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Output of one tracking tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackResult {
    /// Wavelength of the normalized minimum inside the band.
    pub min_wavelength: f64,
    /// Weighted centroid, or `min_wavelength` while the window is not fixed.
    pub centroid: f64,
    /// Normalized intensities over the full spectrum.
    pub normalized: Vec<f64>,
}

/// Dark/flat normalization plus minimum and centroid tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralTracker {
    dark: FieldAccumulator,
    flat: FieldAccumulator,
    gain: f64,
    half_width: usize,
    window: Option<CentroidWindow>,
}

impl Default for SpectralTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FIELD_FRAMES, DEFAULT_CENTROID_HALF_WIDTH)
    }
}

impl SpectralTracker {
    pub fn new(field_frames: usize, half_width: usize) -> Self {
        Self {
            dark: FieldAccumulator::new(field_frames),
            flat: FieldAccumulator::new(field_frames),
            gain: 1.0,
            half_width: half_width.max(1),
            window: None,
        }
    }

    pub fn dark_field(&self) -> Option<&[f64]> {
        self.dark.value()
    }

    pub fn flat_field(&self) -> Option<&[f64]> {
        self.flat.value()
    }

    pub fn dark_accumulator(&self) -> &FieldAccumulator {
        &self.dark
    }

    pub fn flat_accumulator(&self) -> &FieldAccumulator {
        &self.flat
    }

    pub fn normalize_gain(&self) -> f64 {
        self.gain
    }

    pub fn centroid_window(&self) -> Option<CentroidWindow> {
        self.window
    }

    pub fn half_width(&self) -> usize {
        self.half_width
    }

    /// Whether both fields are available, i.e. spectra get normalized.
    pub fn is_normalizing(&self) -> bool {
        self.dark.value().is_some() && self.flat.value().is_some()
    }

    pub fn accumulate_dark(&mut self, intensities: &[f64]) -> PipelineResult<AccumulationStatus> {
        let status = self.dark.accumulate(intensities)?;
        if status == AccumulationStatus::Completed {
            info!("Dark field saved ({} spectra)", self.dark.target());
            self.update_gain();
        }
        Ok(status)
    }

    pub fn accumulate_flat(&mut self, intensities: &[f64]) -> PipelineResult<AccumulationStatus> {
        let status = self.flat.accumulate(intensities)?;
        if status == AccumulationStatus::Completed {
            info!("Flat field saved ({} spectra)", self.flat.target());
            self.update_gain();
        }
        Ok(status)
    }

    /// Restart dark field accumulation from zero.
    pub fn reset_dark(&mut self) {
        self.dark.reset();
    }

    /// Restart flat field accumulation from zero.
    pub fn reset_flat(&mut self) {
        self.flat.reset();
    }

    /// Unfix the centroid window; the next normalized tick recomputes it.
    pub fn reset_centroid_window(&mut self) {
        self.window = None;
    }

    /// Unfix the window and change its half-width, in pixels (at least 1).
    pub fn reset_centroid_window_with(&mut self, half_width: usize) {
        self.half_width = half_width.max(1);
        self.window = None;
    }

    fn update_gain(&mut self) {
        if let (Some(dark), Some(flat)) = (self.dark.value(), self.flat.value()) {
            if dark.len() == flat.len() && !dark.is_empty() {
                let total: f64 = flat.iter().zip(dark).map(|(f, d)| f - d).sum();
                self.gain = total / dark.len() as f64;
                debug!("Normalize gain set to {}", self.gain);
            }
        }
    }

    /// `(I − dark) / (flat − dark) · gain` when both fields are set,
    /// otherwise the intensities unchanged.
    pub fn normalize(&self, intensities: &[f64]) -> PipelineResult<Vec<f64>> {
        let (Some(dark), Some(flat)) = (self.dark.value(), self.flat.value()) else {
            return Ok(intensities.to_vec());
        };
        for field in [dark, flat] {
            if field.len() != intensities.len() {
                return Err(PipelineError::LengthMismatch {
                    expected: field.len(),
                    actual: intensities.len(),
                });
            }
        }
        Ok(intensities
            .iter()
            .zip(dark.iter().zip(flat))
            .map(|(i, (d, f))| (i - d) / (f - d) * self.gain)
            .collect())
    }

    /// Track one spectrum.
    ///
    /// The first normalized tick fixes the centroid window around the
    /// minimum; later ticks reuse it until [`reset_centroid_window`] is
    /// called.
    ///
    /// [`reset_centroid_window`]: SpectralTracker::reset_centroid_window
    pub fn track(&mut self, spectrum: &SpectralFrame, band: &Band) -> PipelineResult<TrackResult> {
        if spectrum.wavelengths.len() != spectrum.intensities.len() {
            return Err(PipelineError::LengthMismatch {
                expected: spectrum.wavelengths.len(),
                actual: spectrum.intensities.len(),
            });
        }
        let normalized = self.normalize(&spectrum.intensities)?;

        // Restricting to the band keeps original indices, so the minimum
        // found here is directly an index into the full spectrum.
        let min_index = spectrum
            .wavelengths
            .iter()
            .zip(&normalized)
            .enumerate()
            .filter(|(_, (w, _))| band.contains(**w))
            .min_by(|(_, (_, a)), (_, (_, b))| a.total_cmp(b))
            .map(|(i, _)| i)
            .ok_or(PipelineError::EmptyBand {
                min: band.min(),
                max: band.max(),
            })?;
        let min_wavelength = spectrum.wavelengths[min_index];

        if self.window.is_none() && self.is_normalizing() {
            let window = CentroidWindow::around(min_index, self.half_width, spectrum.len());
            info!(
                "Position of min peak: {min_wavelength} nm, centroid window {} nm .. {} nm",
                spectrum.wavelengths[window.start],
                spectrum.wavelengths[window.end.saturating_sub(1).max(window.start)]
            );
            self.window = Some(window);
        }

        let centroid = match self.window {
            Some(window) => weighted_centroid(&spectrum.wavelengths, &normalized, window)
                .unwrap_or_else(|| {
                    debug!("Centroid window carries no weight, reporting the minimum");
                    min_wavelength
                }),
            None => min_wavelength,
        };

        Ok(TrackResult {
            min_wavelength,
            centroid,
            normalized,
        })
    }
}

/// `Σ λᵢ (max − nᵢ) / Σ (max − nᵢ)` over the window, with `max` taken over
/// the whole normalized spectrum so the absorption dip becomes a peak.
pub fn weighted_centroid(
    wavelengths: &[f64],
    normalized: &[f64],
    window: CentroidWindow,
) -> Option<f64> {
    let peak = normalized.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = window.range(normalized.len().min(wavelengths.len()));
    let mut num = 0.0;
    let mut den = 0.0;
    for i in range {
        let weight = peak - normalized[i];
        num += wavelengths[i] * weight;
        den += weight;
    }
    (den != 0.0 && den.is_finite()).then(|| num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// 1 nm grid from 490 to 910 with a Gaussian dip centered on `center`.
    fn dip_spectrum(center: f64) -> SpectralFrame {
        let wavelengths: Vec<f64> = (0..=420).map(|i| 490.0 + i as f64).collect();
        let intensities = wavelengths
            .iter()
            .map(|w| 1000.0 - 600.0 * (-(w - center).powi(2) / (2.0 * 15.0f64.powi(2))).exp())
            .collect();
        SpectralFrame::new(wavelengths, intensities).unwrap()
    }

    fn band() -> Band {
        Band::new(500.0, 900.0).unwrap()
    }

    fn tracker_with_fields(len: usize, half_width: usize) -> SpectralTracker {
        let mut tracker = SpectralTracker::new(2, half_width);
        for _ in 0..2 {
            tracker.accumulate_dark(&vec![100.0; len]).unwrap();
            tracker.accumulate_flat(&vec![1100.0; len]).unwrap();
        }
        tracker
    }

    #[test]
    fn unset_fields_leave_spectrum_unnormalized() {
        let spectrum = dip_spectrum(650.0);
        let mut tracker = SpectralTracker::default();
        let out = tracker.track(&spectrum, &band()).unwrap();
        assert_eq!(out.normalized, spectrum.intensities);
        assert_abs_diff_eq!(out.min_wavelength, 650.0);
        assert_eq!(out.centroid, out.min_wavelength);
        assert!(tracker.centroid_window().is_none());
    }

    #[test]
    fn band_bounds_are_excluded() {
        // Minimum sits exactly on 500 nm and must be ignored.
        let wavelengths = vec![500.0, 600.0, 700.0, 900.0];
        let intensities = vec![1.0, 5.0, 3.0, 0.5];
        let spectrum = SpectralFrame::new(wavelengths, intensities).unwrap();
        let out = SpectralTracker::default().track(&spectrum, &band()).unwrap();
        assert_abs_diff_eq!(out.min_wavelength, 700.0);
    }

    #[test]
    fn empty_band_is_reported() {
        let spectrum = SpectralFrame::new(vec![500.0, 900.0], vec![1.0, 2.0]).unwrap();
        let err = SpectralTracker::default().track(&spectrum, &band()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyBand { .. }));
    }

    #[test]
    fn invalid_band_is_configuration_error() {
        assert!(matches!(
            Band::new(900.0, 500.0),
            Err(PipelineError::InvalidConfiguration(_))
        ));
        assert!(Band::new(f64::NAN, 500.0).is_err());
    }

    #[test]
    fn fields_average_and_set_gain() {
        let tracker = tracker_with_fields(4, 10);
        assert_eq!(tracker.dark_field(), Some(&[100.0; 4][..]));
        assert_abs_diff_eq!(tracker.normalize_gain(), 1000.0);
        let normalized = tracker.normalize(&[600.0, 1100.0, 100.0, 350.0]).unwrap();
        assert_eq!(normalized, vec![500.0, 1000.0, 0.0, 250.0]);
    }

    #[test]
    fn new_flat_recomputes_gain() {
        let mut tracker = tracker_with_fields(3, 10);
        tracker.reset_flat();
        tracker.accumulate_flat(&[600.0; 3]).unwrap();
        assert_abs_diff_eq!(tracker.normalize_gain(), 1000.0);
        tracker.accumulate_flat(&[600.0; 3]).unwrap();
        assert_abs_diff_eq!(tracker.normalize_gain(), 500.0);
        assert_eq!(tracker.normalize(&[350.0; 3]).unwrap(), vec![250.0; 3]);
    }

    #[test]
    fn accumulation_reports_progress_and_restarts() {
        let mut acc = FieldAccumulator::new(3);
        assert_eq!(
            acc.accumulate(&[1.0, 2.0]).unwrap(),
            AccumulationStatus::InProgress { count: 1, target: 3 }
        );
        acc.reset();
        assert_eq!(acc.count(), 0);
        acc.accumulate(&[3.0, 3.0]).unwrap();
        acc.accumulate(&[6.0, 9.0]).unwrap();
        assert_eq!(acc.accumulate(&[0.0, 0.0]).unwrap(), AccumulationStatus::Completed);
        assert_eq!(acc.value(), Some(&[3.0, 4.0][..]));
        // A new cycle keeps the finished field until it completes.
        acc.accumulate(&[100.0, 100.0]).unwrap();
        assert_eq!(acc.value(), Some(&[3.0, 4.0][..]));
        assert!(matches!(
            acc.accumulate(&[1.0]),
            Err(PipelineError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn window_fixes_once_and_is_reused() {
        let first = dip_spectrum(650.0);
        let mut tracker = tracker_with_fields(first.len(), 20);
        let out = tracker.track(&first, &band()).unwrap();
        let window = tracker.centroid_window().unwrap();
        assert_eq!(window, CentroidWindow { start: 140, end: 180 });
        // A symmetric dip inside a symmetric window has its centroid slightly
        // below the center because the window is half-open.
        assert!((out.centroid - 650.0).abs() < 1.0);

        let shifted = dip_spectrum(660.0);
        let out = tracker.track(&shifted, &band()).unwrap();
        assert_eq!(tracker.centroid_window(), Some(window));
        assert_abs_diff_eq!(out.min_wavelength, 660.0);
        assert!(out.centroid > 650.0 && out.centroid < 660.0);

        tracker.reset_centroid_window();
        tracker.track(&shifted, &band()).unwrap();
        assert_eq!(
            tracker.centroid_window(),
            Some(CentroidWindow { start: 150, end: 190 })
        );
    }

    #[test]
    fn tracking_is_idempotent_once_window_is_fixed() {
        let spectrum = dip_spectrum(700.0);
        let mut tracker = tracker_with_fields(spectrum.len(), 30);
        tracker.track(&spectrum, &band()).unwrap();
        let a = tracker.track(&spectrum, &band()).unwrap();
        let b = tracker.track(&spectrum, &band()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn window_clamps_each_bound_without_recentering() {
        assert_eq!(
            CentroidWindow::around(5, 20, 100),
            CentroidWindow { start: 0, end: 25 }
        );
        assert_eq!(
            CentroidWindow::around(90, 20, 100),
            CentroidWindow { start: 70, end: 100 }
        );
    }

    #[test]
    fn centroid_of_flat_window_falls_back_to_none() {
        let w = [1.0, 2.0, 3.0];
        let n = [5.0, 5.0, 5.0];
        assert_eq!(weighted_centroid(&w, &n, CentroidWindow { start: 0, end: 3 }), None);
    }
}
