//! Constant source.
//!
//! The constant source is a single shared scalar fed into the crossbar
//! through two crosslanes. Crosslane 14 can only drive lanes 16..32 and
//! crosslane 15 only lanes 0..16; this pairing is fixed in hardware.

use std::ops::Range;

use crate::error::{HybridError, Result};

/// Crosslane serving the upper half of the lanes.
pub const CONSTANT_UPPER: usize = 14;

/// Crosslane serving the lower half of the lanes.
pub const CONSTANT_LOWER: usize = 15;

/// Default value of the constant source.
pub const DEFAULT_CONSTANT: f64 = 1.0;

/// Lanes per half of the crossbar.
const HALF: usize = 16;

/// The constant source and its configured value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantSource {
    pub value: f64,
}

impl Default for ConstantSource {
    fn default() -> Self {
        Self {
            value: DEFAULT_CONSTANT,
        }
    }
}

impl ConstantSource {
    /// Create a constant source with the given value.
    pub fn new(value: f64) -> Self {
        Self { value }
    }

    /// Crosslane that has to be used to reach `lane`.
    pub fn crosslane_for(lane: usize) -> usize {
        if lane < HALF {
            CONSTANT_LOWER
        } else {
            CONSTANT_UPPER
        }
    }

    /// Lanes reachable from a constant crosslane.
    pub fn lanes_of(crosslane: usize) -> Option<Range<usize>> {
        match crosslane {
            CONSTANT_UPPER => Some(HALF..2 * HALF),
            CONSTANT_LOWER => Some(0..HALF),
            _ => None,
        }
    }

    /// Whether `crosslane` is allowed to drive `lane`.
    pub fn accepts(crosslane: usize, lane: usize) -> bool {
        Self::lanes_of(crosslane).is_some_and(|r| r.contains(&lane))
    }

    /// Check the half-space pairing, returning a descriptive error.
    pub fn check(crosslane: usize, lane: usize) -> Result<()> {
        match Self::lanes_of(crosslane) {
            Some(range) if range.contains(&lane) => Ok(()),
            Some(range) => Err(HybridError::ConstantHalfSpace {
                crosslane,
                lane,
                first: range.start,
                last: range.end,
            }),
            None => Err(HybridError::invalid_output(
                crosslane,
                "not a constant crosslane",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_space_pairing() {
        assert!(!ConstantSource::accepts(CONSTANT_UPPER, 0));
        assert!(ConstantSource::accepts(CONSTANT_UPPER, 16));
        assert!(!ConstantSource::accepts(CONSTANT_LOWER, 17));
        assert!(ConstantSource::accepts(CONSTANT_LOWER, 2));
        assert!(!ConstantSource::accepts(3, 2));
    }

    #[test]
    fn test_crosslane_for_lane() {
        assert_eq!(ConstantSource::crosslane_for(15), CONSTANT_LOWER);
        assert_eq!(ConstantSource::crosslane_for(16), CONSTANT_UPPER);
        for lane in 0..32 {
            let crosslane = ConstantSource::crosslane_for(lane);
            assert!(ConstantSource::check(crosslane, lane).is_ok());
        }
    }

    #[test]
    fn test_wrong_half_is_reported() {
        let err = ConstantSource::check(CONSTANT_UPPER, 5).unwrap_err();
        assert!(matches!(
            err,
            HybridError::ConstantHalfSpace {
                crosslane: 14,
                lane: 5,
                first: 16,
                last: 32
            }
        ));
    }
}
