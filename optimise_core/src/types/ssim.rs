//! Type-safe SSIM value, validated to [0.0, 1.0].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Epsilon for SSIM comparisons; looser than a generic f64 epsilon
/// because encoder output varies slightly across invocations.
pub const SSIM_EPSILON: f64 = 1e-4;

pub const SSIM_MIN: f64 = 0.0;
pub const SSIM_MAX: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum SsimError {
    OutOfRange { value: f64 },
    InvalidFloat,
}

impl fmt::Display for SsimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SsimError::OutOfRange { value } => {
                write!(f, "SSIM {:.6} out of range [0.0, 1.0]", value)
            }
            SsimError::InvalidFloat => write!(f, "Invalid SSIM: NaN or Infinity"),
        }
    }
}

impl std::error::Error for SsimError {}

/// Structural similarity score. 1.0 means identical frames, 0.0 means
/// no structural resemblance.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ssim(f64);

impl Ssim {
    pub const PERFECT: Ssim = Ssim(1.0);
    pub const ZERO: Ssim = Ssim(0.0);

    pub fn new(value: f64) -> Result<Self, SsimError> {
        if value.is_nan() || value.is_infinite() {
            return Err(SsimError::InvalidFloat);
        }
        if !(SSIM_MIN..=SSIM_MAX).contains(&value) {
            return Err(SsimError::OutOfRange { value });
        }
        Ok(Self(value))
    }

    /// Clamp into range instead of erroring; NaN/Inf become 0.0.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() || value.is_infinite() {
            Self(0.0)
        } else {
            Self(value.clamp(SSIM_MIN, SSIM_MAX))
        }
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.0
    }

    #[inline]
    pub fn approx_eq(&self, other: &Self) -> bool {
        (self.0 - other.0).abs() < SSIM_EPSILON
    }

    /// Tolerant threshold check: values within SSIM_EPSILON below the
    /// threshold still pass.
    #[inline]
    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.0 >= threshold - SSIM_EPSILON
    }

    pub fn quality_description(&self) -> &'static str {
        if self.0 >= 0.999 {
            "Identical"
        } else if self.0 >= 0.99 {
            "Excellent (visually lossless)"
        } else if self.0 >= 0.95 {
            "Very Good"
        } else if self.0 >= 0.90 {
            "Good"
        } else {
            "Poor"
        }
    }
}

impl fmt::Debug for Ssim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ssim({:.6})", self.0)
    }
}

impl fmt::Display for Ssim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

impl PartialEq for Ssim {
    fn eq(&self, other: &Self) -> bool {
        self.approx_eq(other)
    }
}

impl PartialOrd for Ssim {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_range() {
        assert!(Ssim::new(0.0).is_ok());
        assert!(Ssim::new(1.0).is_ok());
        assert!(Ssim::new(0.995).is_ok());
    }

    #[test]
    fn test_invalid_range() {
        assert!(Ssim::new(-0.1).is_err());
        assert!(Ssim::new(1.1).is_err());
        assert!(Ssim::new(f64::NAN).is_err());
        assert!(Ssim::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_clamped() {
        assert_eq!(Ssim::clamped(1.5).value(), 1.0);
        assert_eq!(Ssim::clamped(-0.5).value(), 0.0);
        assert_eq!(Ssim::clamped(f64::NAN).value(), 0.0);
    }

    #[test]
    fn test_meets_threshold_with_epsilon() {
        let ssim = Ssim::new(0.995).unwrap();
        assert!(ssim.meets_threshold(0.995));
        assert!(ssim.meets_threshold(0.99));
        assert!(!ssim.meets_threshold(0.999));
        // Just inside epsilon below the threshold still passes.
        let near = Ssim::new(0.995 - 0.5e-4).unwrap();
        assert!(near.meets_threshold(0.995));
    }

    #[test]
    fn test_quality_description() {
        assert_eq!(Ssim::new(0.9995).unwrap().quality_description(), "Identical");
        assert_eq!(
            Ssim::new(0.995).unwrap().quality_description(),
            "Excellent (visually lossless)"
        );
        assert_eq!(Ssim::new(0.5).unwrap().quality_description(), "Poor");
    }
}
