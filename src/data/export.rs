use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use super::model::{IntensitySample, SpectralFrame, SpectralSeries};
use crate::error::{PipelineError, PipelineResult};
use crate::processing::fit::{FitModel, FittedCurve, SegmentFit};

// ---------------------------------------------------------------------------
// Table – header-first, row-major text
// ---------------------------------------------------------------------------

/// A header row plus one row of cells per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.header.len());
        self.rows.push(row);
    }

    /// Write as comma-separated values, header first.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&self.header).context("writing header")?;
        for (i, row) in self.rows.iter().enumerate() {
            csv_writer
                .write_record(row)
                .with_context(|| format!("writing row {i}"))?;
        }
        csv_writer.flush().context("flushing CSV")?;
        Ok(())
    }

    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        self.write_csv(file)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// `Time, Intensities` for the camera trace.
pub fn camera_table(samples: &[IntensitySample]) -> Table {
    let mut table = Table::new(&["Time", "Intensities"]);
    for s in samples {
        table.push(vec![s.time.to_string(), s.intensity.to_string()]);
    }
    table
}

/// `Wavelengths, Intensities, Normalized` for one spectrum.
pub fn spectrum_table(frame: &SpectralFrame, normalized: &[f64]) -> PipelineResult<Table> {
    if normalized.len() != frame.len() {
        return Err(PipelineError::LengthMismatch {
            expected: frame.len(),
            actual: normalized.len(),
        });
    }
    let mut table = Table::new(&["Wavelengths", "Intensities", "Normalized"]);
    for ((w, i), n) in frame.wavelengths.iter().zip(&frame.intensities).zip(normalized) {
        table.push(vec![w.to_string(), i.to_string(), n.to_string()]);
    }
    Ok(table)
}

/// `Time, Wavelengths, Comments, Centroids` for the tracked spectral series.
pub fn spectral_series_table(series: &SpectralSeries) -> Table {
    let mut table = Table::new(&["Time", "Wavelengths", "Comments", "Centroids"]);
    for i in 0..series.len() {
        table.push(vec![
            series.time[i].to_string(),
            series.minima[i].to_string(),
            series.comments[i].clone(),
            series.centroids[i].to_string(),
        ]);
    }
    table
}

/// `Time, Fitted` for a reconstructed curve.
pub fn fitted_curve_table(curve: &FittedCurve) -> Table {
    let mut table = Table::new(&["Time", "Fitted"]);
    for (t, v) in curve.points() {
        table.push(vec![t.to_string(), v.to_string()]);
    }
    table
}

/// One row per fitted segment with its model parameters.
///
/// Linear fits leave `c` and `t0` empty.
pub fn fit_parameters_table(fits: &[SegmentFit], titles: &[String]) -> Table {
    let mut table = Table::new(&["Segment", "Title", "Model", "a", "b", "c", "t0"]);
    for fit in fits {
        let title = titles.get(fit.segment).cloned().unwrap_or_default();
        let (model, params) = match fit.model {
            FitModel::Exponential { a, b, c, t0 } => (
                "exponential",
                [a.to_string(), b.to_string(), c.to_string(), t0.to_string()],
            ),
            FitModel::Linear { a, b } => (
                "linear",
                [a.to_string(), b.to_string(), String::new(), String::new()],
            ),
        };
        let mut row = vec![fit.segment.to_string(), title, model.to_string()];
        row.extend(params);
        table.push(row);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{PixelPoint, SpectralSample};

    fn render(table: &Table) -> String {
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn camera_table_is_header_first() {
        let samples = [
            IntensitySample {
                time: 0.0,
                intensity: 120.5,
                center: PixelPoint::new(1, 2),
            },
            IntensitySample {
                time: 0.5,
                intensity: 121.0,
                center: PixelPoint::new(1, 2),
            },
        ];
        assert_eq!(render(&camera_table(&samples)), "Time,Intensities\n0,120.5\n0.5,121\n");
    }

    #[test]
    fn spectral_series_keeps_comments_column() {
        let mut series = SpectralSeries::default();
        series.push(SpectralSample {
            time: 1.5,
            min_wavelength: 650.25,
            centroid: 650.5,
            comment: "GFAP".into(),
        });
        assert_eq!(
            render(&spectral_series_table(&series)),
            "Time,Wavelengths,Comments,Centroids\n1.5,650.25,GFAP,650.5\n"
        );
    }

    #[test]
    fn spectrum_table_checks_normalized_length() {
        let frame = SpectralFrame::new(vec![600.0, 601.0], vec![3.0, 4.0]).unwrap();
        assert!(spectrum_table(&frame, &[1.0]).is_err());
        let table = spectrum_table(&frame, &[0.3, 0.4]).unwrap();
        assert_eq!(table.header, vec!["Wavelengths", "Intensities", "Normalized"]);
        assert_eq!(table.rows[1], vec!["601", "4", "0.4"]);
    }

    #[test]
    fn fit_parameters_leave_linear_columns_blank() {
        let fits = [SegmentFit {
            segment: 0,
            model: FitModel::Linear { a: 2.0, b: 1.0 },
            anchored: false,
        }];
        let table = fit_parameters_table(&fits, &["Start".to_string()]);
        assert_eq!(table.rows[0], vec!["0", "Start", "linear", "2", "1", "", ""]);
    }
}
