use std::cmp::Ordering;
use std::fmt;

/// Largest division kept after normalization. Divisions that grow past this
/// through repeated addition are reduced by small prime factors; one measure
/// at 44.1kHz / 60bpm has this many frames, so finer subdivisions carry no
/// audible information.
pub const MAX_DIVISION: u32 = 384_000;

/// Musical duration as whole bars plus a fraction of a bar.
///
/// The fraction is `units / division`, e.g. `Duration::new(0, 1, 4)` is a
/// quarter of a bar. Values normalize on construction: unit overflow carries
/// into `whole`, and oversized divisions reduce by small prime factors.
#[derive(Debug, Clone, Copy)]
pub struct Duration {
    whole: u32,
    units: u32,
    division: u32,
}

impl Duration {
    /// Create a normalized duration of `whole` bars plus `units/division`.
    ///
    /// Fails with [`TimeError::ZeroDivision`] when `division` is zero.
    pub fn new(whole: u32, units: u32, division: u32) -> Result<Self, TimeError> {
        if division == 0 {
            return Err(TimeError::ZeroDivision);
        }
        let mut duration = Duration {
            whole,
            units,
            division,
        };
        duration.normalize();
        Ok(duration)
    }

    /// Whole bars.
    pub fn whole(&self) -> u32 {
        self.whole
    }

    /// Numerator of the fractional part.
    pub fn units(&self) -> u32 {
        self.units
    }

    /// Denominator of the fractional part.
    pub fn division(&self) -> u32 {
        self.division
    }

    /// Sum of two durations, finding a common division when they differ.
    ///
    /// The common division is computed in 64 bits, so legal operands never
    /// overflow; a result finer than [`MAX_DIVISION`] is reduced exactly
    /// where possible and rounded to the cap otherwise.
    pub fn add(&self, other: &Duration) -> Duration {
        let (units, division) = if self.division == other.division {
            (
                u64::from(self.units) + u64::from(other.units),
                u64::from(self.division),
            )
        } else {
            (
                u64::from(self.units) * u64::from(other.division)
                    + u64::from(other.units) * u64::from(self.division),
                u64::from(self.division) * u64::from(other.division),
            )
        };
        let mut whole = u64::from(self.whole) + u64::from(other.whole) + units / division;
        let mut units = units % division;
        let mut division = division;
        if division > u64::from(MAX_DIVISION) {
            let shared = gcd(units, division);
            units /= shared;
            division /= shared;
        }
        if division > u64::from(MAX_DIVISION) {
            // inaudibly fine (see MAX_DIVISION): round to the cap
            units = ((u128::from(units) * u128::from(MAX_DIVISION) + u128::from(division) / 2)
                / u128::from(division)) as u64;
            division = u64::from(MAX_DIVISION);
            if units == division {
                whole += 1;
                units = 0;
            }
        }
        Duration {
            whole: whole as u32,
            units: units as u32,
            division: division as u32,
        }
    }

    /// Difference of two durations.
    ///
    /// Only durations expressed in the same division can be subtracted; mixed
    /// divisions fail with [`TimeError::MixedDivisions`]. This limitation is
    /// deliberate: callers subtract pattern-relative offsets that share a
    /// division by construction.
    pub fn sub(&self, other: &Duration) -> Result<Duration, TimeError> {
        if self.division != other.division {
            return Err(TimeError::MixedDivisions {
                left: self.division,
                right: other.division,
            });
        }
        let total = self.whole as u64 * self.division as u64 + self.units as u64;
        let other_total = other.whole as u64 * other.division as u64 + other.units as u64;
        let diff = total
            .checked_sub(other_total)
            .ok_or(TimeError::NegativeDuration)?;
        Duration::new(
            (diff / self.division as u64) as u32,
            (diff % self.division as u64) as u32,
            self.division,
        )
    }

    /// Carry unit overflow into whole bars, then reduce oversized divisions
    /// by small prime factors.
    fn normalize(&mut self) {
        if self.units >= self.division {
            self.whole += self.units / self.division;
            self.units %= self.division;
        }
        if self.division > MAX_DIVISION {
            for factor in (2..=7u32).rev() {
                while self.units % factor == 0 && self.division % factor == 0 {
                    self.units /= factor;
                    self.division /= factor;
                }
            }
        }
    }

}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

// Equality and ordering cross-multiply the fractional parts so that e.g.
// 1/2 and 2/4 compare equal. No floating point: exactness is load-bearing
// for event delivery order.
impl PartialEq for Duration {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Duration {}

impl PartialOrd for Duration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Duration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.whole.cmp(&other.whole).then_with(|| {
            let lhs = self.units as u64 * other.division as u64;
            let rhs = other.units as u64 * self.division as u64;
            lhs.cmp(&rhs)
        })
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}+{}/{}", self.whole, self.units, self.division)
    }
}

/// Errors from constructing or combining musical time values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    /// A duration or position was given a zero division.
    ZeroDivision,
    /// Bar indices are 1-based; there is no bar zero.
    ZeroBar,
    /// Subtraction requires both operands to share a division.
    MixedDivisions { left: u32, right: u32 },
    /// Subtraction would produce a negative duration.
    NegativeDuration,
}

impl fmt::Display for TimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeError::ZeroDivision => write!(f, "division cannot be zero"),
            TimeError::ZeroBar => write!(f, "there is no zero bar"),
            TimeError::MixedDivisions { left, right } => {
                write!(f, "cannot subtract different divisions ({left} vs {right})")
            }
            TimeError::NegativeDuration => write!(f, "subtraction would go below zero"),
        }
    }
}

impl std::error::Error for TimeError {}
