//! Signal extraction and drift tracking.
//!
//! ```text
//!  camera frame ──► roi ──────────► intensity series ─┐
//!                                                    ├─► post (smoothing + fit) ─► fitted curve
//!  spectrum ─► smoothing::SavitzkyGolay ─► spectral ─► min / centroid series ─┤
//!                                                    └─► shift ─► marker-to-marker shift
//! ```

pub mod fit;
pub mod post;
pub mod roi;
pub mod shift;
pub mod smoothing;
pub mod spectral;
