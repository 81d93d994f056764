use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, AsArray, Float32Array, Float64Array, Int32Array, Int64Array, LargeListArray,
    ListArray, StringArray,
};
use arrow::datatypes::{DataType, Schema};
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{AnnotatedSeries, Frame, RecordedSpectrum, SpectralFrame};

/// Accepted names for the wavelength axis, in order of preference.
const WAVELENGTH_COLUMNS: [&str; 2] = ["wavelengths", "x"];
/// Accepted names for the intensity axis.
const INTENSITY_COLUMNS: [&str; 2] = ["intensities", "y"];
const TIME_COLUMN: &str = "time";
const COMMENT_COLUMN: &str = "comment";

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a spectrum recording.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – list columns `wavelengths` and `intensities` (or `x`/`y`),
///   optional scalar `time` and `comment` columns
/// * `.json`    – `[{ "wavelengths": [...], "intensities": [...], "time": 0.5, "comment": "" }, ...]`
/// * `.csv`     – `wavelengths` / `intensities` cells of semicolon-separated floats
pub fn load_spectra(path: &Path) -> Result<Vec<RecordedSpectrum>> {
    match extension(path).as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

/// Load a grayscale camera frame from an image file (8-bit luma).
pub fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .to_luma8();
    let (width, height) = image.dimensions();
    Array2::from_shape_vec((height as usize, width as usize), image.into_raw())
        .context("image buffer does not match its dimensions")
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// Series tables
// ---------------------------------------------------------------------------

/// A header-first table as written by the exporter: a `Time` column, any
/// number of numeric columns and an optional `Comments` column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesTable {
    pub time: Vec<f64>,
    pub columns: BTreeMap<String, Vec<f64>>,
    pub comments: Vec<String>,
}

impl SeriesTable {
    /// One numeric column paired with the time axis and the comments.
    pub fn annotated(&self, column: &str) -> Result<AnnotatedSeries> {
        let values = self
            .columns
            .get(column)
            .with_context(|| format!("series has no '{column}' column"))?;
        Ok(AnnotatedSeries::from_columns(
            self.time.clone(),
            values.clone(),
            self.comments.clone(),
        )?)
    }
}

/// Load a series CSV (`Time`, numeric columns, optional `Comments`).
///
/// Missing comments read as empty strings.
pub fn load_series(path: &Path) -> Result<SeriesTable> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening series {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let time_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("time"))
        .context("CSV missing 'Time' column")?;
    let comment_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("comments"));

    let mut table = SeriesTable::default();
    for (col_idx, name) in headers.iter().enumerate() {
        if col_idx != time_idx && Some(col_idx) != comment_idx {
            table.columns.insert(name.clone(), Vec::new());
        }
    }

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        for (col_idx, cell) in record.iter().enumerate() {
            let name = &headers[col_idx];
            if col_idx == time_idx {
                table.time.push(parse_float(cell, row_no, name)?);
            } else if Some(col_idx) == comment_idx {
                table.comments.push(cell.to_string());
            } else if let Some(column) = table.columns.get_mut(name) {
                column.push(parse_float(cell, row_no, name)?);
            }
        }
        if comment_idx.is_none() {
            table.comments.push(String::new());
        }
    }

    Ok(table)
}

fn parse_float(cell: &str, row: usize, col: &str) -> Result<f64> {
    cell.trim()
        .parse::<f64>()
        .with_context(|| format!("Row {row}, {col}: '{cell}' is not a number"))
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

fn load_json(path: &Path) -> Result<Vec<RecordedSpectrum>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root.as_array().context("Expected top-level JSON array")?;

    let mut spectra = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;

        let wavelengths = json_array_to_f64(first_key(obj, &WAVELENGTH_COLUMNS), i, "wavelengths")?;
        let intensities = json_array_to_f64(first_key(obj, &INTENSITY_COLUMNS), i, "intensities")?;
        let frame = SpectralFrame::new(wavelengths, intensities)
            .with_context(|| format!("Row {i}"))?;

        spectra.push(RecordedSpectrum {
            frame,
            time: obj.get(TIME_COLUMN).and_then(JsonValue::as_f64),
            comment: obj
                .get(COMMENT_COLUMN)
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        });
    }
    Ok(spectra)
}

fn first_key<'a>(
    obj: &'a serde_json::Map<String, JsonValue>,
    names: &[&str],
) -> Option<&'a JsonValue> {
    names.iter().find_map(|n| obj.get(*n))
}

fn json_array_to_f64(val: Option<&JsonValue>, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .and_then(|v| v.as_array())
        .with_context(|| format!("Row {row}: missing or invalid '{col}' array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| {
            v.as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout: header row, `wavelengths` and `intensities` cells holding
/// semicolon-separated floats, optional `time` and `comment` columns.
fn load_csv(path: &Path) -> Result<Vec<RecordedSpectrum>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let w_idx = header_position(&headers, &WAVELENGTH_COLUMNS)
        .context("CSV missing 'wavelengths' column")?;
    let i_idx = header_position(&headers, &INTENSITY_COLUMNS)
        .context("CSV missing 'intensities' column")?;
    let t_idx = header_position(&headers, &[TIME_COLUMN]);
    let c_idx = header_position(&headers, &[COMMENT_COLUMN]);

    let mut spectra = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let wavelengths =
            parse_semicolon_floats(record.get(w_idx).unwrap_or(""), row_no, "wavelengths")?;
        let intensities =
            parse_semicolon_floats(record.get(i_idx).unwrap_or(""), row_no, "intensities")?;
        let frame = SpectralFrame::new(wavelengths, intensities)
            .with_context(|| format!("CSV row {row_no}"))?;

        let time = match t_idx.and_then(|i| record.get(i)).filter(|s| !s.is_empty()) {
            Some(cell) => Some(parse_float(cell, row_no, TIME_COLUMN)?),
            None => None,
        };
        let comment = c_idx
            .and_then(|i| record.get(i))
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        spectra.push(RecordedSpectrum {
            frame,
            time,
            comment,
        });
    }
    Ok(spectra)
}

fn header_position(headers: &[String], names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|n| headers.iter().position(|h| h == n))
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> Result<Vec<f64>> {
    s.split(';')
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Expected schema:
/// - `wavelengths` / `intensities` (or `x` / `y`): List<Float64|Float32>
/// - `time`: optional Float64/Float32/Int64/Int32
/// - `comment`: optional Utf8
fn load_parquet(path: &Path) -> Result<Vec<RecordedSpectrum>> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut spectra = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        let w_idx = schema_position(&schema, &WAVELENGTH_COLUMNS)
            .ok_or_else(|| anyhow::anyhow!("Parquet file missing 'wavelengths' column"))?;
        let i_idx = schema_position(&schema, &INTENSITY_COLUMNS)
            .ok_or_else(|| anyhow::anyhow!("Parquet file missing 'intensities' column"))?;
        let time_col = schema_position(&schema, &[TIME_COLUMN]).map(|i| batch.column(i));
        let comment_col = schema_position(&schema, &[COMMENT_COLUMN]).map(|i| batch.column(i));

        let w_col = batch.column(w_idx);
        let i_col = batch.column(i_idx);

        for row in 0..batch.num_rows() {
            let wavelengths = extract_f64_list(w_col, row)
                .with_context(|| format!("Row {row}: failed to read wavelengths"))?;
            let intensities = extract_f64_list(i_col, row)
                .with_context(|| format!("Row {row}: failed to read intensities"))?;
            let frame = SpectralFrame::new(wavelengths, intensities)
                .with_context(|| format!("Row {row}"))?;

            let time = match time_col {
                Some(col) => extract_scalar_f64(col, row)?,
                None => None,
            };
            let comment = comment_col
                .and_then(|col| extract_string(col, row))
                .filter(|s| !s.is_empty());

            spectra.push(RecordedSpectrum {
                frame,
                time,
                comment,
            });
        }
    }

    Ok(spectra)
}

// -- Parquet / Arrow helpers --

fn schema_position(schema: &Schema, names: &[&str]) -> Option<usize> {
    names.iter().find_map(|n| schema.index_of(n).ok())
}

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
fn extract_f64_list(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN) as f64).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected Float64 or Float32",
            values_array.data_type()
        )
    }
}

/// Numeric scalar at `row`, `None` when null.
fn extract_scalar_f64(col: &Arc<dyn Array>, row: usize) -> Result<Option<f64>> {
    if col.is_null(row) {
        return Ok(None);
    }
    let any = col.as_any();
    let value = match col.data_type() {
        DataType::Float64 => any.downcast_ref::<Float64Array>().map(|a| a.value(row)),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| a.value(row) as f64),
        DataType::Int64 => any.downcast_ref::<Int64Array>().map(|a| a.value(row) as f64),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| a.value(row) as f64),
        other => bail!("Expected numeric 'time' column, got {other:?}"),
    };
    value
        .map(Some)
        .context("time column does not match its declared type")
}

/// String at `row`, `None` when null or not a string column.
fn extract_string(col: &Arc<dyn Array>, row: usize) -> Option<String> {
    if col.is_null(row) {
        return None;
    }
    match col.data_type() {
        DataType::Utf8 => col
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|s| s.value(row).to_string()),
        DataType::LargeUtf8 => Some(col.as_string::<i64>().value(row).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_json_spectra_with_annotations() {
        let file = write_temp(
            ".json",
            r#"[
                {"wavelengths": [500.5, 501.0], "intensities": [10, 12], "time": 0.5, "comment": "GFAP"},
                {"x": [500.5, 501.0], "y": [11, 13]}
            ]"#,
        );
        let spectra = load_spectra(file.path()).unwrap();
        assert_eq!(spectra.len(), 2);
        assert_eq!(spectra[0].frame.intensities, vec![10.0, 12.0]);
        assert_eq!(spectra[0].time, Some(0.5));
        assert_eq!(spectra[0].comment.as_deref(), Some("GFAP"));
        assert_eq!(spectra[1].time, None);
    }

    #[test]
    fn loads_csv_spectra() {
        let file = write_temp(
            ".csv",
            "wavelengths,intensities,time,comment\n\"600;601;602\",\"1;0.5;1\",1.0,\n",
        );
        let spectra = load_spectra(file.path()).unwrap();
        assert_eq!(spectra[0].frame.wavelengths, vec![600.0, 601.0, 602.0]);
        assert_eq!(spectra[0].comment, None);
    }

    #[test]
    fn rejects_mismatched_axes_and_unknown_extensions() {
        let file = write_temp(".json", r#"[{"wavelengths": [1, 2], "intensities": [1]}]"#);
        assert!(load_spectra(file.path()).is_err());
        let file = write_temp(".txt", "");
        assert!(load_spectra(file.path()).is_err());
    }

    #[test]
    fn loads_exported_series_table() {
        let file = write_temp(
            ".csv",
            "Time,Wavelengths,Comments,Centroids\n0.0,650.1,,650.3\n0.5,650.2,GFAP,650.4\n",
        );
        let table = load_series(file.path()).unwrap();
        assert_eq!(table.time, vec![0.0, 0.5]);
        assert_eq!(table.comments, vec!["".to_string(), "GFAP".to_string()]);
        let centroids = table.annotated("Centroids").unwrap();
        assert_eq!(centroids.values, vec![650.3, 650.4]);
        assert!(table.annotated("Missing").is_err());
    }

    #[test]
    fn series_without_comments_gets_empty_labels() {
        let file = write_temp(".csv", "Time,Intensities\n0.0,12.5\n0.5,13.0\n");
        let table = load_series(file.path()).unwrap();
        assert_eq!(table.comments, vec![String::new(), String::new()]);
        assert_eq!(table.columns["Intensities"], vec![12.5, 13.0]);
    }

    #[test]
    fn loads_png_frame_as_rows_by_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let img = image::GrayImage::from_fn(4, 3, |x, y| image::Luma([(10 * y + x) as u8]));
        img.save(&path).unwrap();
        let frame = load_frame(&path).unwrap();
        assert_eq!(frame.dim(), (3, 4));
        assert_eq!(frame[[2, 1]], 21);
    }
}
