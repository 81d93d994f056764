//! Writes a synthetic bench session to parquet:
//!
//! * `sample_dark.parquet` – detector offset only
//! * `sample_flat.parquet` – lamp through a blank sensor
//! * `sample_recording.parquet` – an absorption dip that drifts
//!   exponentially after each injection, with `time` and `comment` columns
//!
//! ```bash
//! cargo run --bin generate_sample
//! cargo run -- track sample_recording.parquet --dark sample_dark.parquet \
//!     --flat sample_flat.parquet -o tracked.csv
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, Float64Builder, ListBuilder, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

/// Detector pixels spread over 498–941 nm.
const PIXELS: usize = 2068;
const FIRST_NM: f64 = 498.0;
const LAST_NM: f64 = 941.0;
const DARK_LEVEL: f64 = 100.0;
const FIELD_FRAMES: usize = 50;
const PERIOD_S: f64 = 0.5;

/// `(tick, comment, dip shift reached by the end of the step in nm)`.
const STEPS: [(usize, &str, f64); 4] = [
    (0, "", 0.0),
    (60, "PBS", 0.3),
    (160, "GFAP", 2.3),
    (300, "STOP", 2.1),
];
const TICKS: usize = 400;
const DRIFT_RATE: f64 = 0.08; // 1/s

fn lamp(wavelength: f64) -> f64 {
    3000.0 * (-((wavelength - 700.0) / 180.0).powi(2)).exp()
}

fn dip(wavelength: f64, center: f64) -> f64 {
    1.0 - 0.4 * (-(wavelength - center).powi(2) / (2.0 * 12.0_f64.powi(2))).exp()
}

fn spectrum(wavelengths: &[f64], dip_center: Option<f64>, rng: &mut SimpleRng) -> Vec<f64> {
    wavelengths
        .iter()
        .map(|&w| {
            let transmitted = match dip_center {
                Some(c) => lamp(w) * dip(w, c),
                None => lamp(w),
            };
            DARK_LEVEL + transmitted + rng.gauss(0.0, 4.0)
        })
        .collect()
}

/// Dip center at `tick`: each step relaxes exponentially from where the
/// previous one ended towards its own level.
fn dip_center(tick: usize) -> f64 {
    let mut shift = 0.0;
    for (i, &(begin, _, target)) in STEPS.iter().enumerate() {
        if tick < begin {
            break;
        }
        let end = STEPS.get(i + 1).map_or(tick, |next| next.0.min(tick));
        let t = (end - begin) as f64 * PERIOD_S;
        shift = target + (shift - target) * (-DRIFT_RATE * t).exp();
    }
    650.0 + shift
}

fn comment(tick: usize) -> &'static str {
    STEPS
        .iter()
        .find(|(at, _, _)| *at == tick)
        .map(|(_, c, _)| *c)
        .unwrap_or("")
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// One row per spectrum: `wavelengths`, `intensities` lists plus `time`
/// and `comment` scalars.
struct Recording {
    wavelengths: Vec<Vec<f64>>,
    intensities: Vec<Vec<f64>>,
    time: Vec<f64>,
    comment: Vec<String>,
}

impl Recording {
    fn new() -> Self {
        Self {
            wavelengths: Vec::new(),
            intensities: Vec::new(),
            time: Vec::new(),
            comment: Vec::new(),
        }
    }

    fn push(&mut self, wavelengths: &[f64], intensities: Vec<f64>, time: f64, comment: &str) {
        self.wavelengths.push(wavelengths.to_vec());
        self.intensities.push(intensities);
        self.time.push(time);
        self.comment.push(comment.to_string());
    }

    fn write(&self, path: &Path) -> Result<()> {
        let list_field = || {
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true)))
        };
        let schema = Arc::new(Schema::new(vec![
            Field::new("wavelengths", list_field(), false),
            Field::new("intensities", list_field(), false),
            Field::new("time", DataType::Float64, false),
            Field::new("comment", DataType::Utf8, false),
        ]));

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(list_array(&self.wavelengths)),
                Arc::new(list_array(&self.intensities)),
                Arc::new(Float64Array::from(self.time.clone())),
                Arc::new(StringArray::from(
                    self.comment.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )),
            ],
        )
        .context("building record batch")?;

        let file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut writer = ArrowWriter::try_new(file, schema, None).context("creating writer")?;
        writer.write(&batch).context("writing batch")?;
        writer.close().context("closing writer")?;
        Ok(())
    }
}

fn list_array(rows: &[Vec<f64>]) -> arrow::array::ListArray {
    let mut builder = ListBuilder::new(Float64Builder::new());
    for row in rows {
        let values = builder.values();
        for &v in row {
            values.append_value(v);
        }
        builder.append(true);
    }
    builder.finish()
}

fn main() -> Result<()> {
    let mut rng = SimpleRng::new(42);
    let step = (LAST_NM - FIRST_NM) / (PIXELS - 1) as f64;
    let wavelengths: Vec<f64> = (0..PIXELS).map(|i| FIRST_NM + i as f64 * step).collect();

    let mut dark = Recording::new();
    let mut flat = Recording::new();
    for i in 0..FIELD_FRAMES {
        let t = i as f64 * PERIOD_S;
        let offset: Vec<f64> = (0..PIXELS).map(|_| DARK_LEVEL + rng.gauss(0.0, 4.0)).collect();
        dark.push(&wavelengths, offset, t, "");
        flat.push(&wavelengths, spectrum(&wavelengths, None, &mut rng), t, "");
    }

    let mut recording = Recording::new();
    for tick in 0..TICKS {
        let intensities = spectrum(&wavelengths, Some(dip_center(tick)), &mut rng);
        recording.push(&wavelengths, intensities, tick as f64 * PERIOD_S, comment(tick));
    }

    for (name, rec) in [
        ("sample_dark.parquet", &dark),
        ("sample_flat.parquet", &flat),
        ("sample_recording.parquet", &recording),
    ] {
        rec.write(Path::new(name))?;
        println!("Wrote {} spectra ({PIXELS} pixels each) to {name}", rec.time.len());
    }
    Ok(())
}
