//! Validated value types shared across the engine.

pub mod quality;
pub mod ssim;

pub use quality::{Quality, QualityError, QUALITY_MAX, QUALITY_MIN};
pub use ssim::{Ssim, SsimError, SSIM_EPSILON};
