use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::config::{PipelineConfig, SpectralConfig};
use crate::data::export::{self, Table};
use crate::data::model::{
    AnnotatedSeries, Frame, IntensitySample, PixelPoint, SpectralFrame, SpectralSample,
    SpectralSeries,
};
use crate::error::{PipelineError, PipelineResult};
use crate::processing::fit::UnderdeterminedPolicy;
use crate::processing::post::{post_process, PostProcessed};
use crate::processing::roi::{extract, DetectionParams, RoiShape};
use crate::processing::shift::compute_shift;
use crate::processing::smoothing::SavitzkyGolay;
use crate::processing::spectral::{AccumulationStatus, Band, SpectralTracker, TrackResult};
use crate::protocol::{ProtocolRun, ProtocolStep, PumpClient};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Which tracked spectral series to post-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralQuantity {
    Minima,
    Centroids,
}

/// A protocol title waiting for its liquid to reach the sensor.
#[derive(Debug, Clone, PartialEq)]
struct PendingTitle {
    title: String,
    due_at: f64,
}

/// One acquisition run, independent of any hardware or rendering.
///
/// Times passed to the tick methods are seconds on any monotonic clock;
/// samples are stamped relative to the last [`clear`](Self::clear).
pub struct AcquisitionSession {
    // Camera
    roi: RoiShape,
    detection: DetectionParams,
    center_locked: bool,
    center: PixelPoint,

    // Spectrometer
    spectral: SpectralConfig,
    band: Band,
    smoother: SavitzkyGolay,
    tracker: SpectralTracker,
    capturing_dark: bool,
    capturing_flat: bool,

    // Post-processing
    moving_average_window: usize,
    policy: UnderdeterminedPolicy,
    marker_a: String,
    marker_b: String,

    // Recorded series
    clock_start: f64,
    intensities: Vec<IntensitySample>,
    series: SpectralSeries,
    last_spectrum: Option<(SpectralFrame, TrackResult)>,

    // Annotations
    queued_comment: Option<String>,
    pending_titles: VecDeque<PendingTitle>,
    protocol: Option<ProtocolRun>,
}

impl AcquisitionSession {
    /// Start a session from validated settings. The clock starts at 0.
    pub fn new(config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            roi: config.roi.shape()?,
            detection: config.roi.detection(),
            center_locked: config.roi.center_locked,
            center: PixelPoint::new(config.roi.center_x, config.roi.center_y),
            spectral: config.spectral.clone(),
            band: config.spectral.band()?,
            smoother: config.spectral.smoother(),
            tracker: config.spectral.tracker(),
            capturing_dark: false,
            capturing_flat: false,
            moving_average_window: config.fit.moving_average_window,
            policy: config.fit.underdetermined,
            marker_a: config.shift.marker_a.clone(),
            marker_b: config.shift.marker_b.clone(),
            clock_start: 0.0,
            intensities: Vec::new(),
            series: SpectralSeries::default(),
            last_spectrum: None,
            queued_comment: None,
            pending_titles: VecDeque::new(),
            protocol: None,
        })
    }

    // -- accessors ---------------------------------------------------------

    pub fn intensities(&self) -> &[IntensitySample] {
        &self.intensities
    }

    pub fn spectral_series(&self) -> &SpectralSeries {
        &self.series
    }

    pub fn tracker(&self) -> &SpectralTracker {
        &self.tracker
    }

    /// ROI center used for the last frame (or the configured one).
    pub fn center(&self) -> PixelPoint {
        self.center
    }

    pub fn set_center(&mut self, center: PixelPoint) {
        self.center = center;
    }

    pub fn set_center_locked(&mut self, locked: bool) {
        self.center_locked = locked;
    }

    pub fn set_roi(&mut self, roi: RoiShape) {
        self.roi = roi;
    }

    pub fn set_band(&mut self, band: Band) {
        self.band = band;
    }

    pub fn is_capturing_dark(&self) -> bool {
        self.capturing_dark
    }

    pub fn is_capturing_flat(&self) -> bool {
        self.capturing_flat
    }

    pub fn protocol(&self) -> Option<&ProtocolRun> {
        self.protocol.as_ref()
    }

    /// Drop every recorded series and restart the clock at `now`.
    ///
    /// Dark/flat fields and the centroid window are kept.
    pub fn clear(&mut self, now: f64) {
        self.intensities.clear();
        self.series = SpectralSeries::default();
        self.clock_start = now;
        info!("Series cleared");
    }

    fn elapsed(&self, now: f64) -> f64 {
        now - self.clock_start
    }

    // -- camera ------------------------------------------------------------

    /// Measure one camera frame and append it to the intensity series.
    pub fn camera_tick(&mut self, frame: &Frame, now: f64) -> PipelineResult<IntensitySample> {
        let measurement = extract(
            frame,
            &self.detection,
            &self.roi,
            self.center_locked,
            self.center,
        )?;
        self.center = measurement.center;
        let sample = IntensitySample {
            time: self.elapsed(now),
            intensity: measurement.mean_intensity,
            center: measurement.center,
        };
        debug!(
            "Camera tick t={:.2}s mean={:.3} center=({}, {})",
            sample.time, sample.intensity, sample.center.x, sample.center.y
        );
        self.intensities.push(sample);
        Ok(sample)
    }

    // -- spectrometer ------------------------------------------------------

    /// Trim the detector edges and smooth.
    pub fn preprocess(&self, raw: &SpectralFrame) -> PipelineResult<SpectralFrame> {
        let trim = self.spectral.edge_trim;
        if raw.len() <= 2 * trim {
            return Err(PipelineError::invalid(format!(
                "spectrum of {} samples is too short for an edge trim of {trim}",
                raw.len()
            )));
        }
        let range = trim..raw.len() - trim;
        SpectralFrame::new(
            raw.wavelengths[range.clone()].to_vec(),
            self.smoother.apply(&raw.intensities[range]),
        )
    }

    /// Process one raw spectrum and append `(time, min, centroid, comment)`.
    ///
    /// The spectrum is tracked with the fields as they stand, then fed to
    /// any dark/flat capture in progress.
    pub fn spectrum_tick(&mut self, raw: &SpectralFrame, now: f64) -> PipelineResult<SpectralSample> {
        let spectrum = self.preprocess(raw)?;
        let result = self.tracker.track(&spectrum, &self.band)?;
        self.feed_captures(&spectrum.intensities)?;

        let sample = SpectralSample {
            time: self.elapsed(now),
            min_wavelength: result.min_wavelength,
            centroid: result.centroid,
            comment: self.take_comment(now),
        };
        debug!(
            "Spectrum tick t={:.2}s min={:.3} centroid={:.3}",
            sample.time, sample.min_wavelength, sample.centroid
        );
        self.series.push(sample.clone());
        self.last_spectrum = Some((spectrum, result));
        Ok(sample)
    }

    /// Feed one raw spectrum to the dark/flat capture in progress without
    /// tracking or recording it. `None` when no capture is running.
    pub fn capture_tick(&mut self, raw: &SpectralFrame) -> PipelineResult<Option<AccumulationStatus>> {
        if !self.capturing_dark && !self.capturing_flat {
            return Ok(None);
        }
        let spectrum = self.preprocess(raw)?;
        self.feed_captures(&spectrum.intensities)
    }

    /// Status of the last capture fed, if any was running.
    fn feed_captures(&mut self, intensities: &[f64]) -> PipelineResult<Option<AccumulationStatus>> {
        let mut status = None;
        if self.capturing_dark {
            let dark = self.tracker.accumulate_dark(intensities)?;
            self.capturing_dark = dark != AccumulationStatus::Completed;
            status = Some(dark);
        }
        if self.capturing_flat {
            let flat = self.tracker.accumulate_flat(intensities)?;
            self.capturing_flat = flat != AccumulationStatus::Completed;
            status = Some(flat);
        }
        Ok(status)
    }

    /// Start averaging the next spectra into a new dark field.
    pub fn request_dark(&mut self) {
        self.tracker.reset_dark();
        self.capturing_dark = true;
        info!("Dark field capture started");
    }

    /// Start averaging the next spectra into a new flat field.
    pub fn request_flat(&mut self) {
        self.tracker.reset_flat();
        self.capturing_flat = true;
        info!("Flat field capture started");
    }

    /// Unfix the centroid window with a new half-width given in nm.
    pub fn reset_centroid_window_nm(&mut self, width_nm: f64) {
        let half_width = self.spectral.half_width_from_nm(width_nm);
        info!("Centroid window reset to {half_width} px ({width_nm} nm)");
        self.tracker.reset_centroid_window_with(half_width);
    }

    // -- annotations -------------------------------------------------------

    /// Queue a comment for the next spectrum tick. Returns `false` (and
    /// keeps the earlier one) if a comment is already waiting.
    pub fn queue_comment(&mut self, comment: impl Into<String>) -> bool {
        let comment = comment.into();
        if comment.is_empty() {
            return false;
        }
        if self.queued_comment.is_some() {
            warn!("A comment is already queued, ignoring {comment:?}");
            return false;
        }
        self.queued_comment = Some(comment);
        true
    }

    /// A due protocol title wins; a user comment then waits one more tick.
    fn take_comment(&mut self, now: f64) -> String {
        let title_due = self
            .pending_titles
            .front()
            .is_some_and(|title| now >= title.due_at);
        if title_due {
            if let Some(title) = self.pending_titles.pop_front() {
                return title.title;
            }
        }
        self.queued_comment.take().unwrap_or_default()
    }

    /// Send a validated protocol to the pump and follow its progress.
    pub fn start_protocol<P: PumpClient + ?Sized>(
        &mut self,
        pump: &mut P,
        steps: Vec<ProtocolStep>,
    ) -> anyhow::Result<()> {
        pump.send(&steps)?;
        info!("Protocol sent ({} steps)", steps.len());
        self.protocol = Some(ProtocolRun::new(steps));
        self.pending_titles.clear();
        Ok(())
    }

    /// Collect finished steps; each titled step is scheduled to annotate
    /// the series once its liquid has crossed the tube.
    pub fn poll_pump<P: PumpClient + ?Sized>(&mut self, pump: &mut P, now: f64) -> anyhow::Result<usize> {
        let finished = pump.poll_completed()?;
        let Some(run) = self.protocol.as_mut() else {
            return Ok(finished);
        };
        for _ in 0..finished {
            let Some(step) = run.complete_next() else {
                warn!("Pump reported more finished steps than were sent");
                break;
            };
            if step.title.is_empty() {
                continue;
            }
            let due_at = now + step.transit_time_s();
            debug!("Title {:?} due at {due_at:.2}s", step.title);
            self.pending_titles.push_back(PendingTitle {
                title: step.title.clone(),
                due_at,
            });
        }
        Ok(finished)
    }

    // -- analysis ----------------------------------------------------------

    fn quantity(&self, quantity: SpectralQuantity) -> AnnotatedSeries {
        match quantity {
            SpectralQuantity::Minima => self.series.minima_series(),
            SpectralQuantity::Centroids => self.series.centroid_series(),
        }
    }

    /// Smooth, segment on comments and fit the chosen series.
    pub fn fit(&self, quantity: SpectralQuantity) -> PipelineResult<PostProcessed> {
        let series = self.quantity(quantity);
        post_process(
            &series.time,
            &series.values,
            &series.comments,
            self.moving_average_window,
            self.policy,
        )
    }

    /// Shift between the two configured markers, 0 if it cannot be computed.
    pub fn shift(&self, quantity: SpectralQuantity) -> f64 {
        let series = self.quantity(quantity);
        compute_shift(
            &series.time,
            &series.values,
            &series.comments,
            self.moving_average_window,
            &self.marker_a,
            &self.marker_b,
        )
    }

    // -- export ------------------------------------------------------------

    pub fn camera_table(&self) -> Table {
        export::camera_table(&self.intensities)
    }

    pub fn spectral_table(&self) -> Table {
        export::spectral_series_table(&self.series)
    }

    /// The last processed spectrum with its normalized intensities.
    pub fn spectrum_snapshot(&self) -> PipelineResult<Option<Table>> {
        match &self.last_spectrum {
            Some((frame, result)) => export::spectrum_table(frame, &result.normalized).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::spectral::CentroidWindow;
    use crate::protocol::{PumpAction, ScriptedPump};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.spectral.edge_trim = 10;
        config.spectral.savgol_window = 5;
        config.spectral.field_frames = 2;
        config.spectral.centroid_half_width = 20;
        config
    }

    /// 400..799 nm, 1 nm steps, baseline `level` with an optional dip.
    fn spectrum(level: f64, dip_at: Option<f64>) -> SpectralFrame {
        let wavelengths: Vec<f64> = (0..400).map(|i| 400.0 + i as f64).collect();
        let intensities = wavelengths
            .iter()
            .map(|w| match dip_at {
                Some(c) => level - 60.0 * (-(w - c).powi(2) / 50.0).exp(),
                None => level,
            })
            .collect();
        SpectralFrame::new(wavelengths, intensities).unwrap()
    }

    #[test]
    fn preprocess_trims_edges() {
        let session = AcquisitionSession::new(&config()).unwrap();
        let trimmed = session.preprocess(&spectrum(100.0, None)).unwrap();
        assert_eq!(trimmed.len(), 380);
        assert_eq!(trimmed.wavelengths[0], 410.0);
        assert_abs_diff_eq!(trimmed.intensities[5], 100.0, epsilon = 1e-9);

        let short = SpectralFrame::new(vec![1.0; 20], vec![0.0; 20]).unwrap();
        assert!(session.preprocess(&short).is_err());
    }

    #[test]
    fn fields_then_window_fixed_on_next_spectrum() {
        let mut session = AcquisitionSession::new(&config()).unwrap();
        session.request_dark();
        session.spectrum_tick(&spectrum(10.0, None), 0.0).unwrap();
        session.spectrum_tick(&spectrum(10.0, None), 0.5).unwrap();
        assert!(!session.is_capturing_dark());
        assert!(session.tracker().dark_field().is_some());

        session.request_flat();
        session.spectrum_tick(&spectrum(100.0, None), 1.0).unwrap();
        session.spectrum_tick(&spectrum(100.0, None), 1.5).unwrap();
        assert!(session.tracker().is_normalizing());
        assert!(session.tracker().centroid_window().is_none());

        let sample = session.spectrum_tick(&spectrum(100.0, Some(650.0)), 2.0).unwrap();
        assert_eq!(sample.min_wavelength, 650.0);
        assert_abs_diff_eq!(sample.centroid, 650.0, epsilon = 0.05);
        assert!(session.tracker().centroid_window().is_some());
        assert_eq!(session.spectral_series().len(), 5);

        let snapshot = session.spectrum_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.rows.len(), 380);
    }

    #[test]
    fn clear_restarts_clock_and_keeps_fields() {
        let mut session = AcquisitionSession::new(&config()).unwrap();
        session.request_dark();
        session.spectrum_tick(&spectrum(10.0, None), 3.0).unwrap();
        session.spectrum_tick(&spectrum(10.0, None), 4.0).unwrap();
        session.clear(10.0);
        assert!(session.spectral_series().is_empty());
        assert!(session.tracker().dark_field().is_some());
        let sample = session.spectrum_tick(&spectrum(10.0, None), 12.5).unwrap();
        assert_eq!(sample.time, 2.5);
    }

    #[test]
    fn protocol_title_lands_after_transit() {
        let mut session = AcquisitionSession::new(&config()).unwrap();
        let mut pump = ScriptedPump::new();
        let step = ProtocolStep {
            port: 6,
            action: PumpAction::Dispense,
            volume: 50.0,
            speed: 1000.0,
            title: "PBS".into(),
            wait: 0,
        };
        session.start_protocol(&mut pump, vec![step]).unwrap();
        pump.finish(1);
        assert_eq!(session.poll_pump(&mut pump, 10.0).unwrap(), 1);
        assert!(session.queue_comment("user note"));
        assert!(!session.queue_comment("second note"));

        let flat = spectrum(100.0, Some(650.0));
        // Transit at 1000 µL/min is about 1.66 s.
        assert_eq!(session.spectrum_tick(&flat, 10.5).unwrap().comment, "user note");
        assert_eq!(session.spectrum_tick(&flat, 11.0).unwrap().comment, "");
        assert_eq!(session.spectrum_tick(&flat, 12.0).unwrap().comment, "PBS");
        assert!(session.protocol().unwrap().is_finished());
    }

    #[test]
    fn due_title_defers_user_comment() {
        let mut session = AcquisitionSession::new(&config()).unwrap();
        let mut pump = ScriptedPump::new();
        let step = ProtocolStep {
            port: 7,
            action: PumpAction::Pick,
            volume: 50.0,
            speed: 8000.0,
            title: "GFAP".into(),
            wait: 0,
        };
        session.start_protocol(&mut pump, vec![step]).unwrap();
        pump.finish(1);
        session.poll_pump(&mut pump, 0.0).unwrap();
        session.queue_comment("note");

        let flat = spectrum(100.0, None);
        assert_eq!(session.spectrum_tick(&flat, 5.0).unwrap().comment, "GFAP");
        assert_eq!(session.spectrum_tick(&flat, 5.5).unwrap().comment, "note");
    }

    #[test]
    fn camera_tick_follows_spot_and_keeps_center_in_the_dark() {
        let mut session = AcquisitionSession::new(&PipelineConfig::default()).unwrap();
        let bright: Frame = Array2::from_elem((20, 20), 255u8);
        let sample = session.camera_tick(&bright, 0.0).unwrap();
        assert_eq!(sample.center, PixelPoint::new(9, 9));
        assert_abs_diff_eq!(sample.intensity, 255.0);

        let dark: Frame = Array2::zeros((20, 20));
        let sample = session.camera_tick(&dark, 0.5).unwrap();
        assert_eq!(sample.center, PixelPoint::new(9, 9));
        assert_abs_diff_eq!(sample.intensity, 0.0);
        assert_eq!(session.camera_table().rows.len(), 2);
    }

    #[test]
    fn locked_center_measures_configured_rectangle() {
        let mut config = PipelineConfig::default();
        config.roi.shape = "rectangle".into();
        config.roi.width = 4;
        config.roi.height = 4;
        config.roi.center_locked = true;
        config.roi.center_x = 5;
        config.roi.center_y = 5;
        let mut session = AcquisitionSession::new(&config).unwrap();

        let mut frame: Frame = Array2::zeros((12, 12));
        for y in 3..=7 {
            for x in 3..=7 {
                frame[[y, x]] = 40;
            }
        }
        let sample = session.camera_tick(&frame, 0.0).unwrap();
        assert_eq!(sample.center, PixelPoint::new(5, 5));
        assert_abs_diff_eq!(sample.intensity, 40.0);
    }

    #[test]
    fn fit_runs_on_the_tracked_minima() {
        let mut config = config();
        config.fit.moving_average_window = 1;
        let mut session = AcquisitionSession::new(&config).unwrap();
        for i in 0..6 {
            let dip = 650.0 + i as f64;
            session
                .spectrum_tick(&spectrum(100.0, Some(dip)), i as f64)
                .unwrap();
        }
        let processed = session.fit(SpectralQuantity::Minima).unwrap();
        assert_eq!(processed.segments.len(), 1);
        assert_eq!(processed.curve().len(), 6);
        assert_abs_diff_eq!(processed.curve().values[0], 650.0, epsilon = 1e-3);
    }

    #[test]
    fn shift_uses_configured_markers() {
        let mut config = config();
        config.fit.moving_average_window = 1;
        let mut session = AcquisitionSession::new(&config).unwrap();
        for (i, dip) in [650.0, 651.0, 654.0, 655.0].into_iter().enumerate() {
            match i {
                1 => {
                    session.queue_comment("GFAP");
                }
                3 => {
                    session.queue_comment("STOP");
                }
                _ => {}
            }
            session
                .spectrum_tick(&spectrum(100.0, Some(dip)), i as f64)
                .unwrap();
        }
        assert_abs_diff_eq!(session.shift(SpectralQuantity::Minima), 4.0);
    }

    #[test]
    fn offline_capture_leaves_centroid_window_unfixed() {
        let mut session = AcquisitionSession::new(&config()).unwrap();
        session.request_dark();
        for _ in 0..2 {
            session.capture_tick(&spectrum(10.0, None)).unwrap();
        }
        session.request_flat();
        // One flat spectrum more than the field needs.
        let statuses: Vec<_> = (0..3)
            .map(|_| session.capture_tick(&spectrum(100.0, Some(500.0))).unwrap())
            .collect();
        assert_eq!(statuses[1], Some(AccumulationStatus::Completed));
        assert_eq!(statuses[2], None);
        session.clear(0.0);

        assert!(session.tracker().is_normalizing());
        assert!(session.tracker().centroid_window().is_none());
        assert!(session.spectral_series().is_empty());

        session.spectrum_tick(&spectrum(100.0, Some(650.0)), 1.0).unwrap();
        // 650 nm sits at index 240 of the trimmed spectrum.
        assert_eq!(
            session.tracker().centroid_window(),
            Some(CentroidWindow { start: 220, end: 260 })
        );
    }

    #[test]
    fn recapturing_dark_recomputes_gain() {
        let mut session = AcquisitionSession::new(&config()).unwrap();
        session.request_dark();
        session.capture_tick(&spectrum(10.0, None)).unwrap();
        session.capture_tick(&spectrum(10.0, None)).unwrap();
        session.request_flat();
        session.capture_tick(&spectrum(100.0, None)).unwrap();
        session.capture_tick(&spectrum(100.0, None)).unwrap();
        assert_abs_diff_eq!(session.tracker().normalize_gain(), 90.0, epsilon = 1e-9);

        session.request_dark();
        session.capture_tick(&spectrum(30.0, None)).unwrap();
        // The old dark stays in use until the new one completes.
        assert_abs_diff_eq!(session.tracker().normalize_gain(), 90.0, epsilon = 1e-9);
        session.capture_tick(&spectrum(30.0, None)).unwrap();
        assert!(!session.is_capturing_dark());
        assert_abs_diff_eq!(session.tracker().normalize_gain(), 70.0, epsilon = 1e-9);
    }

    #[test]
    fn centroid_window_reset_takes_width_in_nm() {
        let mut config = config();
        config.spectral.pixels_per_nm = 1.0;
        let mut session = AcquisitionSession::new(&config).unwrap();
        session.request_dark();
        session.capture_tick(&spectrum(10.0, None)).unwrap();
        session.capture_tick(&spectrum(10.0, None)).unwrap();
        session.request_flat();
        session.capture_tick(&spectrum(100.0, None)).unwrap();
        session.capture_tick(&spectrum(100.0, None)).unwrap();
        session.spectrum_tick(&spectrum(100.0, Some(650.0)), 0.0).unwrap();
        assert_eq!(
            session.tracker().centroid_window(),
            Some(CentroidWindow { start: 220, end: 260 })
        );

        session.reset_centroid_window_nm(5.5);
        assert_eq!(session.tracker().half_width(), 5);
        assert!(session.tracker().centroid_window().is_none());

        let sample = session.spectrum_tick(&spectrum(100.0, Some(660.0)), 0.5).unwrap();
        assert_eq!(
            session.tracker().centroid_window(),
            Some(CentroidWindow { start: 245, end: 255 })
        );
        assert!((sample.centroid - 660.0).abs() < 1.0);
    }
}
