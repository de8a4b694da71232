//! Microsecond durations used for step timing and connection event arithmetic.
//!
//! Channel Sounding timing is specified in microseconds, while connection and procedure intervals
//! are specified in units of 1.25 ms and 0.625 ms. [`Duration`] normalizes all of them to
//! microseconds and uses 32-bit saturating arithmetic.

use core::fmt;
use core::ops::{Add, AddAssign, Mul, Sub};

/// A duration with microsecond resolution.
///
/// This can represent a maximum duration of about 1 hour. Arithmetic saturates instead of wrapping.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u32);

impl Duration {
    /// The zero duration.
    pub const ZERO: Self = Duration(0);

    /// Creates a [`Duration`] from a number of microseconds.
    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    /// Creates a [`Duration`] representing the given number of milliseconds.
    pub fn from_millis(millis: u16) -> Self {
        Duration(u32::from(millis) * 1_000)
    }

    /// Creates a [`Duration`] from a connection interval value in units of 1.25 ms.
    pub fn from_conn_interval_units(units: u16) -> Self {
        Duration(u32::from(units) * 1_250)
    }

    /// Creates a [`Duration`] from a number of 0.625 ms slots.
    pub fn from_slots(slots: u32) -> Self {
        Duration(slots.saturating_mul(625))
    }

    /// Returns the number of whole milliseconds that fit in `self`.
    pub fn whole_millis(&self) -> u32 {
        self.0 / 1_000
    }

    /// Returns the number of microseconds represented by `self`.
    pub const fn as_micros(&self) -> u32 {
        self.0
    }

    /// Subtracts `rhs`, returning `None` if the result would be negative.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Duration)
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<u32> for Duration {
    type Output = Self;

    fn mul(self, rhs: u32) -> Self {
        Duration(self.0.saturating_mul(rhs))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1000 {
            let (millis, submilli_micros) = (self.whole_millis(), self.0 % 1000);
            if submilli_micros == 0 {
                write!(f, "{}ms", millis)
            } else {
                write!(f, "{}.{:03}ms", millis, submilli_micros)
            }
        } else {
            write!(f, "{}µs", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units() {
        assert_eq!(Duration::from_conn_interval_units(6).as_micros(), 7_500);
        assert_eq!(Duration::from_slots(2).as_micros(), 1_250);
        assert_eq!(Duration::from_millis(4).as_micros(), 4_000);
    }

    #[test]
    fn saturating() {
        let d = Duration::from_micros(10);
        assert_eq!(d - Duration::from_micros(20), Duration::ZERO);
        assert_eq!(d.checked_sub(Duration::from_micros(20)), None);
        assert_eq!(Duration::from_micros(u32::MAX) + d, Duration::from_micros(u32::MAX));
        assert_eq!(d * 3, Duration::from_micros(30));
    }

    #[test]
    fn display() {
        assert_eq!(Duration::from_micros(145).to_string(), "145µs");
        assert_eq!(Duration::from_micros(1_250).to_string(), "1.250ms");
        assert_eq!(Duration::from_micros(4_000_000).to_string(), "4000ms");
    }
}
