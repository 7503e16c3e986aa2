use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;

use super::duration::{Duration, TimeError};
use crate::transport::Transport;

/// A point in musical time: a 1-based bar index plus a fraction of that bar.
///
/// Positions order exactly like [`Duration`]s and convert to a signed frame
/// offset against the host's current transport position each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    // whole bars since bar 1, so ordering and addition reuse Duration's rules
    inner: Duration,
}

impl Position {
    /// Create a position at `units/division` into `bar`.
    ///
    /// Bars are 1-based: `bar == 0` fails with [`TimeError::ZeroBar`].
    pub fn new(bar: u32, units: u32, division: u32) -> Result<Self, TimeError> {
        if bar == 0 {
            return Err(TimeError::ZeroBar);
        }
        Ok(Position {
            inner: Duration::new(bar - 1, units, division)?,
        })
    }

    /// The 1-based bar index.
    pub fn bar(&self) -> u32 {
        self.inner.whole() + 1
    }

    pub fn units(&self) -> u32 {
        self.inner.units()
    }

    pub fn division(&self) -> u32 {
        self.inner.division()
    }

    /// Frame offset of this position relative to the host's current transport
    /// position, in frames from the start of the current cycle.
    ///
    /// Negative offsets are legal and meaningful: the position is in the
    /// immediate past (late events within the grace window still fire).
    pub fn frame_offset(&self, pos: &Transport) -> i64 {
        // event tick within its bar
        let evt_tick =
            self.units() as f64 * pos.ticks_per_beat * pos.beats_per_bar / self.division() as f64;
        // tick distance from the transport's current BBT position
        let bars = self.bar() as f64 - pos.bar as f64;
        let tick_offset = (bars * pos.beats_per_bar + 1.0 - pos.beat as f64) * pos.ticks_per_beat
            + evt_tick
            - pos.tick as f64;
        // ticks to frames at the current tempo
        (tick_offset * pos.frame_rate as f64 * 60.0 / (pos.ticks_per_beat * pos.beats_per_minute))
            as i64
    }
}

impl Add<Duration> for Position {
    type Output = Position;

    /// Place a pattern-relative duration at an absolute schedule point.
    fn add(self, duration: Duration) -> Position {
        Position {
            inner: self.inner.add(&duration),
        }
    }
}

impl PartialEq<Duration> for Position {
    fn eq(&self, other: &Duration) -> bool {
        self.inner == *other
    }
}

impl PartialOrd<Duration> for Position {
    fn partial_cmp(&self, other: &Duration) -> Option<Ordering> {
        self.inner.partial_cmp(other)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}+{}/{}", self.bar(), self.units(), self.division())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_at(bar: u32, beat: u32, tick: u32) -> Transport {
        Transport {
            frame: 0,
            frame_rate: 48_000,
            bar,
            beat,
            tick,
            bar_start_tick: 0.0,
            ticks_per_beat: 1920.0,
            beats_per_bar: 4.0,
            beats_per_minute: 120.0,
            bbt_valid: true,
        }
    }

    #[test]
    fn test_zero_bar_rejected() {
        assert_eq!(Position::new(0, 0, 1), Err(TimeError::ZeroBar));
    }

    #[test]
    fn test_frame_offset_one_bar_ahead() {
        // at 120bpm 4/4, one bar is two seconds = 96000 frames at 48k
        let pos = Position::new(2, 0, 1).unwrap();
        assert_eq!(pos.frame_offset(&transport_at(1, 1, 0)), 96_000);
    }

    #[test]
    fn test_frame_offset_one_beat_ahead() {
        let pos = Position::new(1, 1, 4).unwrap();
        assert_eq!(pos.frame_offset(&transport_at(1, 1, 0)), 24_000);
    }

    #[test]
    fn test_frame_offset_negative_when_past() {
        let pos = Position::new(1, 0, 1).unwrap();
        assert_eq!(pos.frame_offset(&transport_at(2, 1, 0)), -96_000);
    }

    #[test]
    fn test_frame_offset_accounts_for_tick() {
        // transport half a beat (960 ticks) into bar 1
        let pos = Position::new(1, 1, 4).unwrap();
        assert_eq!(pos.frame_offset(&transport_at(1, 1, 960)), 12_000);
    }

    #[test]
    fn test_add_duration_carries_bars() {
        let pos = Position::new(1, 3, 4).unwrap();
        let next = pos + Duration::new(0, 2, 4).unwrap();
        assert_eq!(next.bar(), 2);
        assert_eq!(next.units(), 1);
        assert_eq!(next.division(), 4);
    }

    #[test]
    fn test_ordering_matches_musical_time() {
        let a = Position::new(1, 1, 2).unwrap();
        let b = Position::new(1, 2, 4).unwrap();
        let c = Position::new(2, 0, 1).unwrap();
        assert_eq!(a, b);
        assert!(a < c);
    }
}
