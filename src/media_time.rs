//! Exact rational timestamps.

use std::cmp::Ordering;
use std::fmt;

/// A point on the media timeline: `value / timescale` seconds.
///
/// Comparisons cross-multiply in 128-bit integers, so two times with
/// different timescales compare exactly and never drift.
#[derive(Debug, Clone, Copy)]
pub struct MediaTime {
    value: i64,
    timescale: u32,
}

impl MediaTime {
    /// Ticks per second used by the segment interchange format.
    pub const INTERCHANGE_TIMESCALE: u32 = 600;

    /// Panics only if `timescale` is zero, which is a programming error.
    pub const fn new(value: i64, timescale: u32) -> Self {
        assert!(timescale > 0, "MediaTime timescale must be non-zero");
        Self { value, timescale }
    }

    pub const fn zero() -> Self {
        Self::new(0, 1)
    }

    /// Nearest tick to `seconds` at `timescale`. Non-finite input maps to zero.
    pub fn from_seconds(seconds: f64, timescale: u32) -> Self {
        if !seconds.is_finite() {
            return Self::new(0, timescale);
        }
        let ticks = (seconds * f64::from(timescale)).round();
        let ticks = ticks.clamp(i64::MIN as f64, i64::MAX as f64) as i64;
        Self::new(ticks, timescale)
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn seconds(&self) -> f64 {
        self.value as f64 / f64::from(self.timescale)
    }

    /// Re-expresses this time at another timescale, rounding towards negative infinity.
    pub fn rescale(&self, timescale: u32) -> Self {
        let numerator = i128::from(self.value) * i128::from(timescale);
        let ticks = numerator.div_euclid(i128::from(self.timescale));
        Self::new(saturate_i64(ticks), timescale)
    }

    /// Exact difference `self - other`, expressed at `self`'s timescale when
    /// the result is representable there, otherwise at the product timescale.
    pub fn checked_sub(&self, other: &MediaTime) -> Option<MediaTime> {
        if self.timescale == other.timescale {
            return self
                .value
                .checked_sub(other.value)
                .map(|value| MediaTime::new(value, self.timescale));
        }
        let timescale = self.timescale.checked_mul(other.timescale)?;
        let lhs = i128::from(self.value) * i128::from(other.timescale);
        let rhs = i128::from(other.value) * i128::from(self.timescale);
        i64::try_from(lhs - rhs)
            .ok()
            .map(|value| MediaTime::new(value, timescale))
    }

    fn cross(&self, other: &MediaTime) -> (i128, i128) {
        (
            i128::from(self.value) * i128::from(other.timescale),
            i128::from(other.value) * i128::from(self.timescale),
        )
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        let (lhs, rhs) = self.cross(other);
        lhs == rhs
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let (lhs, rhs) = self.cross(other);
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({:.3}s)", self.value, self.timescale, self.seconds())
    }
}

fn saturate_i64(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
    use super::MediaTime;

    #[test]
    fn equal_times_at_different_timescales_compare_equal() {
        assert_eq!(MediaTime::new(16_000, 16_000), MediaTime::new(600, 600));
        assert!(MediaTime::new(1, 3) > MediaTime::new(333, 1000));
    }

    #[test]
    fn from_seconds_rounds_to_nearest_tick() {
        let time = MediaTime::from_seconds(1.0009, 600);
        assert_eq!(time.value(), 601);
        assert_eq!(MediaTime::from_seconds(f64::NAN, 600).value(), 0);
    }

    #[test]
    fn rescale_floors_towards_negative_infinity() {
        assert_eq!(MediaTime::new(7, 16_000).rescale(600).value(), 0);
        assert_eq!(MediaTime::new(-1, 16_000).rescale(600).value(), -1);
        assert_eq!(MediaTime::new(16_000, 16_000).rescale(30).value(), 30);
    }

    #[test]
    fn checked_sub_is_exact_across_timescales() {
        let delta = MediaTime::new(1, 2)
            .checked_sub(&MediaTime::new(1, 3))
            .expect("representable");
        assert_eq!(delta, MediaTime::new(1, 6));
    }
}
