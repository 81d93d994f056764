use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use biosense_drift::data::export::{fit_parameters_table, fitted_curve_table};
use biosense_drift::data::loader::{load_series, load_spectra};
use biosense_drift::processing::post::post_process;
use biosense_drift::processing::shift::try_compute_shift;
use biosense_drift::protocol::load_protocol;
use biosense_drift::source::{FrameSource, ImageDirectory, ReplaySpectra, SpectrumSource};
use biosense_drift::{AcquisitionSession, PipelineConfig, SpectralQuantity};

#[derive(Parser)]
#[command(name = "biosense-drift")]
#[command(about = "Offline drift tracking over recorded camera frames and spectra", long_about = None)]
struct Cli {
    /// Pipeline settings (TOML); defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Smooth, segment on comments and fit an exported series
    Fit {
        /// Series CSV with a Time column (and optionally Comments)
        series: PathBuf,
        /// Column to fit
        #[arg(long, default_value = "Centroids")]
        column: String,
        /// Where to write the fitted curve (Time, Fitted)
        #[arg(long, short)]
        output: PathBuf,
        /// Also write the per-segment model parameters
        #[arg(long)]
        parameters: Option<PathBuf>,
    },

    /// Shift between two comment markers in an exported series
    Shift {
        series: PathBuf,
        #[arg(long, default_value = "Centroids")]
        column: String,
        /// Overrides shift.marker_a
        #[arg(long)]
        from: Option<String>,
        /// Overrides shift.marker_b
        #[arg(long)]
        to: Option<String>,
    },

    /// Track minimum and centroid over a spectrum recording
    Track {
        /// Recording (.parquet, .json or .csv)
        recording: PathBuf,
        /// Recording averaged into the dark field
        #[arg(long)]
        dark: Option<PathBuf>,
        /// Recording averaged into the flat field
        #[arg(long)]
        flat: Option<PathBuf>,
        /// Where to write Time, Wavelengths, Comments, Centroids
        #[arg(long, short)]
        output: PathBuf,
        /// Also write the last spectrum with its normalized intensities
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Mean ROI intensity over a directory of camera frames
    Roi {
        frames: PathBuf,
        /// Where to write Time, Intensities
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Validate a pump protocol and print the title delays
    Protocol { file: PathBuf },
}

#[derive(Clone, Copy)]
enum Field {
    Dark,
    Flat,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Fit {
            series,
            column,
            output,
            parameters,
        } => fit(&config, &series, &column, &output, parameters.as_deref()),
        Commands::Shift {
            series,
            column,
            from,
            to,
        } => shift(&config, &series, &column, from, to),
        Commands::Track {
            recording,
            dark,
            flat,
            output,
            snapshot,
        } => track(
            &config,
            &recording,
            dark.as_deref(),
            flat.as_deref(),
            &output,
            snapshot.as_deref(),
        ),
        Commands::Roi { frames, output } => roi(&config, &frames, &output),
        Commands::Protocol { file } => protocol(&file),
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn fit(
    config: &PipelineConfig,
    path: &Path,
    column: &str,
    output: &Path,
    parameters: Option<&Path>,
) -> Result<()> {
    let series = load_series(path)?.annotated(column)?;
    let processed = post_process(
        &series.time,
        &series.values,
        &series.comments,
        config.fit.moving_average_window,
        config.fit.underdetermined,
    )?;

    for (fit, segment) in processed.fit.fits.iter().zip(&processed.segments) {
        info!("{} ({} points): {:?}", segment.title, segment.values.len(), fit.model);
    }
    fitted_curve_table(processed.curve()).save_csv(output)?;
    if let Some(path) = parameters {
        let titles: Vec<String> = processed.segments.iter().map(|s| s.title.clone()).collect();
        fit_parameters_table(&processed.fit.fits, &titles).save_csv(path)?;
    }
    println!(
        "Fitted {} segments over {} points (window {}) → {}",
        processed.fit.fits.len(),
        processed.curve().len(),
        processed.window,
        output.display()
    );
    Ok(())
}

fn shift(
    config: &PipelineConfig,
    path: &Path,
    column: &str,
    from: Option<String>,
    to: Option<String>,
) -> Result<()> {
    let series = load_series(path)?.annotated(column)?;
    let marker_a = from.unwrap_or_else(|| config.shift.marker_a.clone());
    let marker_b = to.unwrap_or_else(|| config.shift.marker_b.clone());
    let shift = try_compute_shift(
        &series.values,
        &series.comments,
        config.fit.moving_average_window,
        &marker_a,
        &marker_b,
    )
    .with_context(|| format!("computing shift {marker_a} → {marker_b} on {column}"))?;
    println!("Shift {marker_a} → {marker_b} on {column}: {shift:.4}");
    Ok(())
}

fn track(
    config: &PipelineConfig,
    recording: &Path,
    dark: Option<&Path>,
    flat: Option<&Path>,
    output: &Path,
    snapshot: Option<&Path>,
) -> Result<()> {
    let mut session = AcquisitionSession::new(config)?;
    if let Some(path) = dark {
        capture_field(&mut session, path, Field::Dark)?;
    }
    if let Some(path) = flat {
        capture_field(&mut session, path, Field::Flat)?;
    }
    session.clear(0.0);

    let mut source = ReplaySpectra::new(load_spectra(recording)?);
    let mut tick = 0usize;
    while let Some(spectrum) = source.next_spectrum()? {
        let now = spectrum
            .time
            .unwrap_or(tick as f64 * config.acquisition.period_s);
        if let Some(comment) = spectrum.comment {
            session.queue_comment(comment);
        }
        session
            .spectrum_tick(&spectrum.frame, now)
            .with_context(|| format!("spectrum {tick}"))?;
        tick += 1;
    }

    session.spectral_table().save_csv(output)?;
    if let Some(path) = snapshot {
        match session.spectrum_snapshot()? {
            Some(table) => table.save_csv(path)?,
            None => warn!("No spectrum processed, snapshot not written"),
        }
    }

    println!("Tracked {tick} spectra → {}", output.display());
    for quantity in [SpectralQuantity::Minima, SpectralQuantity::Centroids] {
        println!("Shift ({quantity:?}): {:.4}", session.shift(quantity));
    }
    Ok(())
}

/// Average a recording into a dark or flat field. Spectra past the
/// field size are ignored; none of them is tracked.
fn capture_field(session: &mut AcquisitionSession, path: &Path, field: Field) -> Result<()> {
    let spectra = load_spectra(path)?;
    match field {
        Field::Dark => session.request_dark(),
        Field::Flat => session.request_flat(),
    }
    let mut used = 0usize;
    for spectrum in &spectra {
        if session.capture_tick(&spectrum.frame)?.is_none() {
            break;
        }
        used += 1;
    }

    let (capturing, accumulator) = match field {
        Field::Dark => (session.is_capturing_dark(), session.tracker().dark_accumulator()),
        Field::Flat => (session.is_capturing_flat(), session.tracker().flat_accumulator()),
    };
    if capturing {
        bail!(
            "{} holds {} spectra, the field needs {} ({} pending)",
            path.display(),
            spectra.len(),
            accumulator.target(),
            accumulator.count()
        );
    }
    if used < spectra.len() {
        warn!(
            "{}: averaged the first {used} spectra, ignored {}",
            path.display(),
            spectra.len() - used
        );
    }
    Ok(())
}

fn roi(config: &PipelineConfig, frames: &Path, output: &Path) -> Result<()> {
    let mut session = AcquisitionSession::new(config)?;
    let mut source = ImageDirectory::open(frames)?;
    if source.is_empty() {
        bail!("no image frames in {}", frames.display());
    }

    let mut tick = 0usize;
    while let Some(frame) = source.next_frame()? {
        session
            .camera_tick(&frame, tick as f64 * config.acquisition.period_s)
            .with_context(|| format!("frame {tick}"))?;
        tick += 1;
    }

    session.camera_table().save_csv(output)?;
    let center = session.center();
    println!(
        "Measured {tick} frames, last center ({}, {}) → {}",
        center.x,
        center.y,
        output.display()
    );
    Ok(())
}

fn protocol(path: &Path) -> Result<()> {
    let steps = load_protocol(path)?;
    for (i, step) in steps.iter().enumerate() {
        println!(
            "{:>3}  port {:>2}  {:<8} {:>6.1} µL @ {:>7.1} µL/min  title {:?} after {:.1} s",
            i + 1,
            step.port,
            step.action.to_string(),
            step.volume,
            step.speed,
            step.title,
            step.transit_time_s()
        );
    }
    println!("{} steps OK", steps.len());
    Ok(())
}
