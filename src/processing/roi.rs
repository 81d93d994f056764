//! Region-of-interest intensity extraction from camera frames.
//!
//! ```text
//!  frame ─► blur 15×15 ─► threshold ─► dilate ×n ─► moments ─► center
//!                                                              │
//!  frame ──────────────────────── mean under ROI mask ◄────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use log::debug;
use ndarray::Array2;

use crate::data::model::{Frame, PixelPoint};
use crate::error::{PipelineError, PipelineResult};

/// Side of the square Gaussian kernel used before thresholding.
pub const BLUR_KERNEL: usize = 15;

// ---------------------------------------------------------------------------
// ROI shape
// ---------------------------------------------------------------------------

/// Shape of the region over which intensity is averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiShape {
    /// Filled disk of the given radius (pixels).
    Circle { radius: u32 },
    /// Axis-aligned rectangle of the given size (pixels).
    Rectangle { width: u32, height: u32 },
}

/// The shape names accepted in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiShapeKind {
    Circle,
    Rectangle,
}

impl FromStr for RoiShapeKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "circle" => Ok(RoiShapeKind::Circle),
            "rectangle" => Ok(RoiShapeKind::Rectangle),
            other => Err(PipelineError::invalid(format!(
                "invalid ROI shape type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RoiShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoiShapeKind::Circle => write!(f, "circle"),
            RoiShapeKind::Rectangle => write!(f, "rectangle"),
        }
    }
}

impl RoiShape {
    /// Build a shape from a configured name and dimensions.
    ///
    /// Only the dimensions relevant to the named shape are checked.
    pub fn from_parts(kind: &str, radius: u32, width: u32, height: u32) -> PipelineResult<Self> {
        match kind.parse::<RoiShapeKind>()? {
            RoiShapeKind::Circle if radius == 0 => {
                Err(PipelineError::invalid("ROI radius must be positive"))
            }
            RoiShapeKind::Circle => Ok(RoiShape::Circle { radius }),
            RoiShapeKind::Rectangle if width == 0 || height == 0 => Err(
                PipelineError::invalid("ROI width and height must be positive"),
            ),
            RoiShapeKind::Rectangle => Ok(RoiShape::Rectangle { width, height }),
        }
    }

    pub fn kind(&self) -> RoiShapeKind {
        match self {
            RoiShape::Circle { .. } => RoiShapeKind::Circle,
            RoiShape::Rectangle { .. } => RoiShapeKind::Rectangle,
        }
    }

    /// Whether pixel `(x, y)` lies inside the shape centered at `center`.
    pub fn contains(&self, center: PixelPoint, x: i64, y: i64) -> bool {
        let dx = x - center.x;
        let dy = y - center.y;
        match *self {
            RoiShape::Circle { radius } => {
                let r = i64::from(radius);
                dx * dx + dy * dy <= r * r
            }
            RoiShape::Rectangle { width, height } => {
                let hw = i64::from(width / 2);
                let hh = i64::from(height / 2);
                (-hw..=hw).contains(&dx) && (-hh..=hh).contains(&dy)
            }
        }
    }

    /// Half extents of the bounding box, `(x, y)`.
    fn half_extent(&self) -> (i64, i64) {
        match *self {
            RoiShape::Circle { radius } => (i64::from(radius), i64::from(radius)),
            RoiShape::Rectangle { width, height } => {
                (i64::from(width / 2), i64::from(height / 2))
            }
        }
    }
}

/// Blob-detection settings used when the ROI is free to follow the spot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Pixels strictly above this value (after blurring) belong to the spot.
    pub threshold: f64,
    /// Side of the square dilation kernel.
    pub kernel_size: usize,
    /// Number of dilation passes.
    pub dilation_count: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            threshold: 90.0,
            kernel_size: 3,
            dilation_count: 2,
        }
    }
}

/// Output of one extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiMeasurement {
    pub mean_intensity: f64,
    pub center: PixelPoint,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Mean intensity of `frame` under the ROI, and the center the ROI was placed at.
///
/// With `center_locked` the ROI sits at `fallback_center`; otherwise it is
/// centered on the thresholded, dilated spot, falling back to
/// `fallback_center` when nothing crosses the threshold.
pub fn extract(
    frame: &Frame,
    params: &DetectionParams,
    roi: &RoiShape,
    center_locked: bool,
    fallback_center: PixelPoint,
) -> PipelineResult<RoiMeasurement> {
    let center = if center_locked {
        fallback_center
    } else {
        if params.kernel_size == 0 {
            return Err(PipelineError::invalid("dilation kernel size must be positive"));
        }
        let blurred = gaussian_blur(frame, BLUR_KERNEL);
        let mut mask = binary_threshold(&blurred, params.threshold);
        for _ in 0..params.dilation_count {
            mask = dilate(&mask, params.kernel_size);
        }
        match mask_centroid(&mask) {
            Some(c) => c,
            None => {
                debug!("No pixel above threshold {}, keeping previous center", params.threshold);
                fallback_center
            }
        }
    };

    let mean_intensity = mean_under_roi(frame, roi, center)?;
    Ok(RoiMeasurement {
        mean_intensity,
        center,
    })
}

/// Arithmetic mean of the frame pixels covered by `roi` at `center`.
pub fn mean_under_roi(frame: &Frame, roi: &RoiShape, center: PixelPoint) -> PipelineResult<f64> {
    let (rows, cols) = frame.dim();
    let (hx, hy) = roi.half_extent();
    let x0 = (center.x - hx).max(0);
    let x1 = (center.x + hx).min(cols as i64 - 1);
    let y0 = (center.y - hy).max(0);
    let y1 = (center.y + hy).min(rows as i64 - 1);

    let mut sum = 0u64;
    let mut count = 0u64;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if roi.contains(center, x, y) {
                sum += u64::from(frame[[y as usize, x as usize]]);
                count += 1;
            }
        }
    }
    if count == 0 {
        return Err(PipelineError::EmptyRoi {
            x: center.x,
            y: center.y,
        });
    }
    Ok(sum as f64 / count as f64)
}

// ---------------------------------------------------------------------------
// Image operations
// ---------------------------------------------------------------------------

/// Reflect-101 border: `-1 → 1`, `n → n - 2`.
fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Normalized 1D Gaussian with σ derived from the kernel size.
fn gaussian_kernel(size: usize) -> Vec<f64> {
    let sigma = 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (size as f64 - 1.0) / 2.0;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / total).collect()
}

/// Separable Gaussian blur with a `size × size` kernel.
pub fn gaussian_blur(frame: &Frame, size: usize) -> Frame {
    let (rows, cols) = frame.dim();
    if rows == 0 || cols == 0 || size <= 1 {
        return frame.clone();
    }
    let kernel = gaussian_kernel(size);
    let half = (size / 2) as isize;

    let mut horizontal = Array2::<f64>::zeros((rows, cols));
    for y in 0..rows {
        for x in 0..cols {
            horizontal[[y, x]] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let sx = reflect_101(x as isize + k as isize - half, cols);
                    w * f64::from(frame[[y, sx]])
                })
                .sum();
        }
    }

    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let v: f64 = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| {
                let sy = reflect_101(y as isize + k as isize - half, rows);
                w * horizontal[[sy, x]]
            })
            .sum();
        v.round().clamp(0.0, 255.0) as u8
    })
}

/// 255 where the pixel is strictly above `threshold`, 0 elsewhere.
pub fn binary_threshold(frame: &Frame, threshold: f64) -> Frame {
    frame.mapv(|v| if f64::from(v) > threshold { 255 } else { 0 })
}

/// One pass of grayscale dilation with a `size × size` square of ones.
///
/// Pixels outside the frame do not contribute.
pub fn dilate(mask: &Frame, size: usize) -> Frame {
    let (rows, cols) = mask.dim();
    let anchor = (size / 2) as isize;
    let reach = |i: usize, n: usize| {
        let lo = (i as isize - anchor).max(0) as usize;
        let hi = ((i as isize + size as isize - 1 - anchor).min(n as isize - 1)) as usize;
        lo..=hi
    };

    let horizontal = Array2::from_shape_fn((rows, cols), |(y, x)| {
        reach(x, cols).map(|sx| mask[[y, sx]]).max().unwrap_or(0)
    });
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        reach(y, rows).map(|sy| horizontal[[sy, x]]).max().unwrap_or(0)
    })
}

/// Centroid of a 0/255 mask from its raw moments, floored to whole pixels.
pub fn mask_centroid(mask: &Frame) -> Option<PixelPoint> {
    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    for ((y, x), &v) in mask.indexed_iter() {
        let v = f64::from(v);
        m00 += v;
        m10 += x as f64 * v;
        m01 += y as f64 * v;
    }
    if m00 == 0.0 {
        return None;
    }
    Some(PixelPoint::new(
        (m10 / m00).floor() as i64,
        (m01 / m00).floor() as i64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn frame_with_block(rows: usize, cols: usize, bg: u8, fg: u8, block: (usize, usize, usize, usize)) -> Frame {
        let (y0, y1, x0, x1) = block;
        Array2::from_shape_fn((rows, cols), |(y, x)| {
            if (y0..=y1).contains(&y) && (x0..=x1).contains(&x) {
                fg
            } else {
                bg
            }
        })
    }

    #[test]
    fn locked_center_is_returned_unchanged() {
        let frame = Array2::from_elem((40, 60), 42u8);
        let roi = RoiShape::Circle { radius: 5 };
        let center = PixelPoint::new(17, 23);
        let m = extract(&frame, &DetectionParams::default(), &roi, true, center).unwrap();
        assert_eq!(m.center, center);
        assert_abs_diff_eq!(m.mean_intensity, 42.0);
    }

    #[test]
    fn rectangle_mean_only_counts_pixels_inside() {
        // Bright 5×7 block exactly matching a width 6 / height 4 rectangle
        // (integer halves 3 and 2 → 7 columns × 5 rows).
        let frame = frame_with_block(30, 30, 10, 200, (8, 12, 12, 18));
        let roi = RoiShape::Rectangle { width: 6, height: 4 };
        let m = extract(&frame, &DetectionParams::default(), &roi, true, PixelPoint::new(15, 10)).unwrap();
        assert_abs_diff_eq!(m.mean_intensity, 200.0);
    }

    #[test]
    fn circle_mean_over_disk() {
        let center = PixelPoint::new(20, 20);
        let roi = RoiShape::Circle { radius: 6 };
        let frame = Array2::from_shape_fn((41, 41), |(y, x)| {
            if roi.contains(center, x as i64, y as i64) { 150 } else { 5 }
        });
        let mean = mean_under_roi(&frame, &roi, center).unwrap();
        assert_abs_diff_eq!(mean, 150.0);
    }

    #[test]
    fn detection_follows_bright_spot() {
        let frame = frame_with_block(80, 80, 0, 250, (40, 50, 20, 30));
        let params = DetectionParams::default();
        let roi = RoiShape::Circle { radius: 3 };
        let m = extract(&frame, &params, &roi, false, PixelPoint::new(0, 0)).unwrap();
        // Symmetric block centered on (25, 45).
        assert!((m.center.x - 25).abs() <= 1, "x = {}", m.center.x);
        assert!((m.center.y - 45).abs() <= 1, "y = {}", m.center.y);
        assert_abs_diff_eq!(m.mean_intensity, 250.0);
    }

    #[test]
    fn dark_frame_falls_back_to_previous_center() {
        let frame = Array2::from_elem((20, 20), 3u8);
        let fallback = PixelPoint::new(4, 9);
        let roi = RoiShape::Rectangle { width: 2, height: 2 };
        let m = extract(&frame, &DetectionParams::default(), &roi, false, fallback).unwrap();
        assert_eq!(m.center, fallback);
    }

    #[test]
    fn roi_outside_frame_is_an_error() {
        let frame = Array2::from_elem((10, 10), 1u8);
        let roi = RoiShape::Circle { radius: 2 };
        let err = mean_under_roi(&frame, &roi, PixelPoint::new(100, 100)).unwrap_err();
        assert_eq!(err, PipelineError::EmptyRoi { x: 100, y: 100 });
    }

    #[test]
    fn unknown_shape_is_invalid_configuration() {
        let err = RoiShape::from_parts("triangle", 5, 5, 5).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
        assert!(RoiShape::from_parts("circle", 0, 5, 5).is_err());
        assert_eq!(
            RoiShape::from_parts("Rectangle", 0, 8, 4).unwrap(),
            RoiShape::Rectangle { width: 8, height: 4 }
        );
    }

    #[test]
    fn dilation_grows_single_pixel() {
        let mut mask = Array2::<u8>::zeros((7, 7));
        mask[[3, 3]] = 255;
        let grown = dilate(&mask, 3);
        assert_eq!(grown.iter().filter(|&&v| v == 255).count(), 9);
        let twice = dilate(&grown, 3);
        assert_eq!(twice.iter().filter(|&&v| v == 255).count(), 25);
    }

    #[test]
    fn blur_keeps_constant_frames() {
        let frame = Array2::from_elem((20, 20), 77u8);
        assert_eq!(gaussian_blur(&frame, BLUR_KERNEL), frame);
    }

    #[test]
    fn reflect_101_mirrors_without_repeating_edge() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
    }
}
