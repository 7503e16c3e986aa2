//! Time-ordered event delivery from the script thread to the process thread.

pub mod buffer;

pub use buffer::{event_buffer, Due, EventBufferConfig, EventQueue, EventWriter};

use crate::time::Position;

/// An object that can be scheduled at a musical position.
///
/// Implementors are created on the script thread, owned by exactly one
/// event buffer until delivered, then handed to the collector. The frame
/// offset is recomputed from the position every cycle since tempo and
/// transport location can change underneath a scheduled event.
pub trait ScheduledEvent: Send + 'static {
    fn position(&self) -> Position;
}
