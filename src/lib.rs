//! Real-time scheduling and concurrency substrate for live-coded audio/MIDI.
//!
//! Everything here serves one split: a script thread that may allocate,
//! block and fail, and a process thread that must do none of those. Musical
//! time is exact rational arithmetic, hand-offs are bounded lock-free queues,
//! and every object crossing the boundary is freed on the thread that owns
//! the allocator side.

pub mod cache; // per-run survivorship of live nodes
pub mod collect; // deferred cross-thread destruction
pub mod dispatch; // process-to-script callback queue
pub mod engine; // the host callback state machine
pub mod event; // time-ordered event delivery
pub mod graph; // connection graph and pull execution
pub mod midi;
pub mod mixer; // gain-matrix mixer node
pub mod queue; // SPSC building blocks
pub mod time; // rational musical time
pub mod transport;

pub use engine::{audio_engine, EngineConfig, EngineError, ProcessEngine, ScriptContext};
pub use time::{Duration, Position, TimeError};
pub use transport::{Transport, TransportState};
