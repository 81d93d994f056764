//! Data layer: core types, loading, and export.
//!
//! Architecture:
//! ```text
//!  .parquet / .json / .csv / .png
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file → RecordedSpectrum / SeriesTable / Frame
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────────┐
//!   │    model      │  frames, spectra, append-only series
//!   └──────────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  export   │  series → header-first tables → CSV
//!   └──────────┘
//! ```

pub mod export;
pub mod loader;
pub mod model;
