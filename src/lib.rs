//! Signal extraction and drift tracking for a camera / spectrometer
//! biosensing bench.
//!
//! ```text
//!  FrameSource ──► session::camera_tick ───► intensity series ──┐
//!                                                              ├─► data::export (CSV)
//!  SpectrumSource ─► session::spectrum_tick ─► min / centroid ──┤
//!                        ▲                                     └─► processing::post / shift
//!  PumpClient ─► protocol titles (after tube transit)
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod processing;
pub mod protocol;
pub mod session;
pub mod source;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use session::{AcquisitionSession, SpectralQuantity};
