//! Pipeline settings, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) gives the bench
//! startup values.
//!
//! ```toml
//! [roi]
//! shape = "rectangle"
//! width = 800
//! height = 600
//!
//! [spectral]
//! band_min = 550.0
//! band_max = 850.0
//!
//! [fit]
//! moving_average_window = 20
//! underdetermined = "degrade"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::processing::fit::UnderdeterminedPolicy;
use crate::processing::roi::{DetectionParams, RoiShape};
use crate::processing::shift::{DEFAULT_MARKER_A, DEFAULT_MARKER_B};
use crate::processing::smoothing::SavitzkyGolay;
use crate::processing::spectral::{
    Band, SpectralTracker, DEFAULT_CENTROID_HALF_WIDTH, DEFAULT_FIELD_FRAMES,
};

/// Detector pixels per nanometre: 2068 pixels span 498–941 nm.
pub const DEFAULT_PIXELS_PER_NM: f64 = 2068.0 / (941.0 - 498.0);

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub roi: RoiConfig,
    pub spectral: SpectralConfig,
    pub fit: FitConfig,
    pub shift: ShiftConfig,
    pub acquisition: AcquisitionConfig,
}

impl PipelineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in config {}", path.display()))
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(text).context("parsing TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that the processing stages would otherwise reject
    /// mid-acquisition.
    pub fn validate(&self) -> PipelineResult<()> {
        self.roi.shape()?;
        if self.roi.kernel_size == 0 {
            return Err(PipelineError::invalid("roi.kernel_size must be positive"));
        }
        self.spectral.band()?;
        if self.spectral.field_frames == 0 {
            return Err(PipelineError::invalid("spectral.field_frames must be positive"));
        }
        if !(self.spectral.pixels_per_nm > 0.0) {
            return Err(PipelineError::invalid("spectral.pixels_per_nm must be positive"));
        }
        if !(self.acquisition.period_s > 0.0) {
            return Err(PipelineError::invalid("acquisition.period_s must be positive"));
        }
        if self.shift.marker_a.is_empty() || self.shift.marker_b.is_empty() {
            return Err(PipelineError::invalid("shift markers must not be empty"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Camera region of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoiConfig {
    /// `"circle"` or `"rectangle"`.
    pub shape: String,
    pub radius: u32,
    pub width: u32,
    pub height: u32,
    pub threshold: f64,
    pub kernel_size: usize,
    pub dilation_count: usize,
    /// Keep the ROI at the configured center instead of following the spot.
    pub center_locked: bool,
    pub center_x: i64,
    pub center_y: i64,
}

impl Default for RoiConfig {
    fn default() -> Self {
        let detection = DetectionParams::default();
        Self {
            shape: "circle".into(),
            radius: 500,
            width: 1000,
            height: 1000,
            threshold: detection.threshold,
            kernel_size: detection.kernel_size,
            dilation_count: detection.dilation_count,
            center_locked: false,
            center_x: 0,
            center_y: 0,
        }
    }
}

impl RoiConfig {
    pub fn shape(&self) -> PipelineResult<RoiShape> {
        RoiShape::from_parts(&self.shape, self.radius, self.width, self.height)
    }

    pub fn detection(&self) -> DetectionParams {
        DetectionParams {
            threshold: self.threshold,
            kernel_size: self.kernel_size,
            dilation_count: self.dilation_count,
        }
    }
}

/// Spectrometer pre-processing and tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpectralConfig {
    pub band_min: f64,
    pub band_max: f64,
    /// Spectra averaged into each dark/flat field.
    pub field_frames: usize,
    /// Centroid half-width in detector pixels.
    pub centroid_half_width: usize,
    pub pixels_per_nm: f64,
    /// Samples dropped at each end of every raw spectrum.
    pub edge_trim: usize,
    pub savgol_window: usize,
    pub savgol_polyorder: usize,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            band_min: 500.0,
            band_max: 900.0,
            field_frames: DEFAULT_FIELD_FRAMES,
            centroid_half_width: DEFAULT_CENTROID_HALF_WIDTH,
            pixels_per_nm: DEFAULT_PIXELS_PER_NM,
            edge_trim: 100,
            savgol_window: 100,
            savgol_polyorder: 2,
        }
    }
}

impl SpectralConfig {
    pub fn band(&self) -> PipelineResult<Band> {
        Band::new(self.band_min, self.band_max)
    }

    pub fn smoother(&self) -> SavitzkyGolay {
        SavitzkyGolay::new(self.savgol_window, self.savgol_polyorder)
    }

    pub fn tracker(&self) -> SpectralTracker {
        SpectralTracker::new(self.field_frames, self.centroid_half_width)
    }

    /// Convert a centroid width entered in nm to pixels, at least 1.
    pub fn half_width_from_nm(&self, width_nm: f64) -> usize {
        let pixels = (width_nm.max(0.0) * self.pixels_per_nm).floor();
        (pixels as usize).max(1)
    }
}

/// Offline fitting of the tracked series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    pub moving_average_window: usize,
    pub underdetermined: UnderdeterminedPolicy,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            moving_average_window: 20,
            underdetermined: UnderdeterminedPolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShiftConfig {
    pub marker_a: String,
    pub marker_b: String,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            marker_a: DEFAULT_MARKER_A.into(),
            marker_b: DEFAULT_MARKER_B.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionConfig {
    /// Seconds between acquisition ticks; used to timestamp replays.
    pub period_s: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self { period_s: 0.5 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.roi.shape().unwrap(), RoiShape::Circle { radius: 500 });
        assert_eq!(config.fit.moving_average_window, 20);
        assert_eq!(config.shift.marker_b, "STOP");
    }

    #[test]
    fn sections_override_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [roi]
            shape = "rectangle"
            width = 80
            height = 60

            [fit]
            underdetermined = "fail"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.roi.shape().unwrap(),
            RoiShape::Rectangle { width: 80, height: 60 }
        );
        assert_eq!(config.fit.underdetermined, UnderdeterminedPolicy::Fail);
        assert_eq!(config.spectral.field_frames, 50);
    }

    #[test]
    fn bad_shape_and_band_are_rejected() {
        assert!(PipelineConfig::from_toml_str("[roi]\nshape = \"hexagon\"").is_err());
        assert!(PipelineConfig::from_toml_str("[spectral]\nband_min = 900.0\nband_max = 500.0").is_err());
        assert!(PipelineConfig::from_toml_str("[fit]\nwindow = 3").is_err());
    }

    #[test]
    fn centroid_width_converts_to_pixels() {
        let spectral = SpectralConfig::default();
        // 50 nm at ~4.67 px/nm.
        assert_eq!(spectral.half_width_from_nm(50.0), 233);
        assert_eq!(spectral.half_width_from_nm(0.0), 1);
    }
}
