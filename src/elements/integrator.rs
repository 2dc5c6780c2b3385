//! Integrator configuration: initial condition and time scaling.

use serde::{Deserialize, Serialize};

/// k0 of a fast integrator; simulated time in "k0 units" is measured
/// relative to this value.
pub const K0_REFERENCE: f64 = 10_000.0;

/// Integrator time constant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeScale {
    /// k0 = 10000
    #[default]
    Fast,
    /// k0 = 100
    Slow,
}

impl TimeScale {
    /// Integration constant in 1/s.
    pub const fn k0(self) -> u32 {
        match self {
            TimeScale::Fast => 10_000,
            TimeScale::Slow => 100,
        }
    }

    /// Parse a raw k0 value as it appears in the config tree.
    pub fn from_k0(k0: u32) -> Option<Self> {
        match k0 {
            10_000 => Some(TimeScale::Fast),
            100 => Some(TimeScale::Slow),
            _ => None,
        }
    }
}

/// Per-integrator configuration state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegratorConfig {
    /// Initial condition in machine units
    pub ic: f64,
    pub time_scale: TimeScale,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            ic: 0.0,
            time_scale: TimeScale::Fast,
        }
    }
}

impl IntegratorConfig {
    pub fn new(ic: f64, time_scale: TimeScale) -> Self {
        Self { ic, time_scale }
    }

    /// Whether the initial condition lies within the [-1, 1] machine range.
    pub fn ic_in_range(&self) -> bool {
        (-1.0..=1.0).contains(&self.ic)
    }

    /// Factor applied to the integrator input to obtain d(state)/dt.
    ///
    /// In realtime mode time is in seconds and the factor is k0 itself.
    /// Otherwise time is in units of 1/[`K0_REFERENCE`] seconds, so a fast
    /// integrator has factor 1 and a slow one 0.01.
    pub fn rate(&self, realtime: bool) -> f64 {
        let k0 = self.time_scale.k0() as f64;
        if realtime {
            k0
        } else {
            k0 / K0_REFERENCE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let fast = IntegratorConfig::new(0.0, TimeScale::Fast);
        let slow = IntegratorConfig::new(0.0, TimeScale::Slow);
        assert_eq!(fast.rate(false), 1.0);
        assert_eq!(slow.rate(false), 0.01);
        assert_eq!(fast.rate(true), 10_000.0);
        assert_eq!(slow.rate(true), 100.0);
    }

    #[test]
    fn test_k0_round_trip() {
        for scale in [TimeScale::Fast, TimeScale::Slow] {
            assert_eq!(TimeScale::from_k0(scale.k0()), Some(scale));
        }
        assert_eq!(TimeScale::from_k0(1000), None);
    }

    #[test]
    fn test_ic_range() {
        assert!(IntegratorConfig::new(-1.0, TimeScale::Fast).ic_in_range());
        assert!(!IntegratorConfig::new(1.5, TimeScale::Slow).ic_in_range());
    }
}
