//! Rational musical time: bar-fraction durations and 1-based bar positions.
//!
//! All comparisons are exact (cross-multiplied integers, never floats) so
//! event ordering is deterministic regardless of the division an event was
//! expressed in.

pub mod duration;
pub mod position;
pub mod signature;

pub use duration::{Duration, TimeError};
pub use position::Position;
pub use signature::TimeSignature;
