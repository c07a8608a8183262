//! Fixed-point time conversion.
//!
//! A [`TimeConverter`] captures a period or latency as a fixed factor of
//! core time units, converting between element-local cycle counts and the
//! global [`SimTime`](crate::types::SimTime) timeline.

use serde::{Deserialize, Serialize};

use crate::types::SimTime;

/// Fixed-point representation of a period or latency.
///
/// The factor is the length of one local cycle in core time units. For a
/// sync tier the factor is the epoch spacing floor; for a link it is the
/// latency quantum.
///
/// # Round trip
///
/// For any cycle count `x`, `to_cycles(to_core_time(x)) == x`.
///
/// ```
/// use lockstep::time::TimeConverter;
///
/// let tc = TimeConverter::new(25);
/// assert_eq!(tc.to_core_time(4), 100);
/// assert_eq!(tc.to_cycles(tc.to_core_time(4)), 4);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConverter {
    factor: SimTime,
}

impl TimeConverter {
    /// Creates a converter with the given factor (core time units per cycle).
    ///
    /// A zero factor is a configuration bug and aborts.
    pub fn new(factor: SimTime) -> Self {
        assert!(factor > 0, "time converter factor must be positive");
        Self { factor }
    }

    /// The length of one cycle in core time units.
    #[inline]
    pub fn factor(&self) -> SimTime {
        self.factor
    }

    /// Converts a local cycle count to core time.
    #[inline]
    pub fn to_core_time(&self, cycles: SimTime) -> SimTime {
        cycles * self.factor
    }

    /// Converts core time to a local cycle count (truncating).
    #[inline]
    pub fn to_cycles(&self, time: SimTime) -> SimTime {
        time / self.factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let tc = TimeConverter::new(7);
        for x in [0u64, 1, 2, 13, 1_000_000] {
            assert_eq!(tc.to_cycles(tc.to_core_time(x)), x);
        }
    }

    #[test]
    fn test_truncating_conversion() {
        let tc = TimeConverter::new(10);
        assert_eq!(tc.to_cycles(99), 9);
        assert_eq!(tc.to_cycles(100), 10);
        assert_eq!(tc.to_cycles(101), 10);
    }

    #[test]
    fn test_factor() {
        assert_eq!(TimeConverter::new(42).factor(), 42);
    }

    #[test]
    #[should_panic(expected = "factor must be positive")]
    fn test_zero_factor_aborts() {
        let _ = TimeConverter::new(0);
    }
}
