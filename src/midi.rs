//! MIDI messages at the engine boundary.
//!
//! Validation happens here, on the script thread, when a message is built;
//! by the time a message crosses into the real-time graph it is known good.

use std::fmt;

use crate::cache::CachedHandle;
use crate::collect::Recycler;
use crate::event::{event_buffer, EventBufferConfig, EventQueue, EventWriter, ScheduledEvent};
use crate::graph::{Inputs, NodeId, PortBuffers, ProcessScope, Processor, Services};
use crate::time::Position;

/// A validated MIDI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
}

impl MidiMessage {
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Result<Self, MidiError> {
        validate_channel(channel)?;
        validate_data(note)?;
        validate_data(velocity)?;
        Ok(MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        })
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Result<Self, MidiError> {
        validate_channel(channel)?;
        validate_data(note)?;
        validate_data(velocity)?;
        Ok(MidiMessage::NoteOff {
            channel,
            note,
            velocity,
        })
    }

    /// Controller zero is reserved (bank select); scripts always mean 1-127.
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Result<Self, MidiError> {
        validate_channel(channel)?;
        if controller == 0 {
            return Err(MidiError::ZeroController);
        }
        validate_data(controller)?;
        validate_data(value)?;
        Ok(MidiMessage::ControlChange {
            channel,
            controller,
            value,
        })
    }

    pub fn program_change(channel: u8, program: u8) -> Result<Self, MidiError> {
        validate_channel(channel)?;
        validate_data(program)?;
        Ok(MidiMessage::ProgramChange { channel, program })
    }

    pub fn channel(&self) -> u8 {
        match *self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. } => channel,
        }
    }
}

fn validate_channel(channel: u8) -> Result<(), MidiError> {
    if channel == 0 || channel > 16 {
        Err(MidiError::BadChannel(channel))
    } else {
        Ok(())
    }
}

fn validate_data(value: u8) -> Result<(), MidiError> {
    if value > 127 {
        Err(MidiError::BadDataByte(value))
    } else {
        Ok(())
    }
}

/// A message stamped with its frame offset inside the current block.
/// This is what midi output ports carry, one list per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub frame: u32,
    pub message: MidiMessage,
}

/// A message scheduled at a musical position, headed for the process thread.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledMidi {
    position: Position,
    message: MidiMessage,
}

impl ScheduledMidi {
    pub fn new(position: Position, message: MidiMessage) -> Self {
        Self { position, message }
    }

    pub fn message(&self) -> MidiMessage {
        self.message
    }
}

impl ScheduledEvent for ScheduledMidi {
    fn position(&self) -> Position {
        self.position
    }
}

/// Build both halves of a MIDI output around an allocated node id.
///
/// The node is a sink for scheduled messages: it drains its event buffer in
/// position order each cycle and emits frame-stamped [`MidiEvent`]s on its
/// single MIDI port, where a host adapter (or another node) picks them up.
pub(crate) fn midi_output(
    node: NodeId,
    config: EventBufferConfig,
) -> (MidiOutputHandle, MidiOutputNode) {
    let (writer, events) = event_buffer(config);
    (MidiOutputHandle { node, writer }, MidiOutputNode { events })
}

/// Script-thread handle to a MIDI output.
pub struct MidiOutputHandle {
    node: NodeId,
    writer: EventWriter<ScheduledMidi>,
}

impl MidiOutputHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Schedule a message at a musical position.
    pub fn schedule(&mut self, position: Position, message: MidiMessage) {
        self.writer.schedule(ScheduledMidi::new(position, message));
    }
}

impl CachedHandle for MidiOutputHandle {
    fn restore(&mut self) {
        // no per-run script state; scheduled messages stay queued
    }

    fn node(&self) -> NodeId {
        self.node
    }
}

/// Process-thread half of a MIDI output.
pub struct MidiOutputNode {
    events: EventQueue<ScheduledMidi>,
}

impl Processor for MidiOutputNode {
    fn do_process(
        &mut self,
        scope: &ProcessScope,
        _inputs: &Inputs<'_>,
        outputs: &mut PortBuffers,
        services: &mut Services<'_>,
    ) {
        while let Some(due) =
            self.events
                .next_event(scope.rolling, &scope.pos, scope.nframes, services.recycler)
        {
            outputs.midi[0].push(MidiEvent {
                // inside the grace window a late message plays at the block start
                frame: due.offset.max(0) as u32,
                message: due.event.message(),
            });
            services.recycler.recycle(due.event);
        }
    }

    fn reposition(&mut self, recycler: &mut Recycler) {
        self.events.recycle_remaining(recycler);
    }
}

/// Script-visible MIDI construction errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiError {
    /// Channels are 1-16.
    BadChannel(u8),
    /// Data bytes are 0-127.
    BadDataByte(u8),
    /// Controller numbers start at 1.
    ZeroController,
}

impl fmt::Display for MidiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiError::BadChannel(c) => write!(f, "invalid MIDI channel {c} (expected 1-16)"),
            MidiError::BadDataByte(v) => write!(f, "invalid MIDI data byte {v} (expected 0-127)"),
            MidiError::ZeroController => write!(f, "controller number cannot be zero"),
        }
    }
}

impl std::error::Error for MidiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_bounds() {
        assert!(MidiMessage::note_on(1, 60, 100).is_ok());
        assert!(MidiMessage::note_on(16, 60, 100).is_ok());
        assert_eq!(
            MidiMessage::note_on(0, 60, 100),
            Err(MidiError::BadChannel(0))
        );
        assert_eq!(
            MidiMessage::note_on(17, 60, 100),
            Err(MidiError::BadChannel(17))
        );
    }

    #[test]
    fn test_zero_controller_rejected() {
        assert_eq!(
            MidiMessage::control_change(1, 0, 64),
            Err(MidiError::ZeroController)
        );
        assert!(MidiMessage::control_change(1, 7, 64).is_ok());
    }

    #[test]
    fn test_data_byte_range() {
        assert_eq!(
            MidiMessage::note_on(1, 128, 100),
            Err(MidiError::BadDataByte(128))
        );
    }

    #[test]
    fn test_output_node_emits_in_order_with_frame_stamps() {
        use crate::collect::collector;
        use crate::dispatch::dispatch;
        use crate::graph::ProcessGraph;
        use crate::transport::Transport;

        let mut graph = ProcessGraph::new(4, 512);
        let id = NodeId(0);
        let (mut handle, node) = midi_output(id, EventBufferConfig::default());
        graph.insert(id, Box::new(node), 0, PortBuffers::new(0, 1, 512));

        let on = MidiMessage::note_on(1, 60, 100).unwrap();
        let off = MidiMessage::note_off(1, 60, 0).unwrap();
        // scheduled out of order; 8/3840 of a bar is 200 frames here
        handle.schedule(Position::new(1, 8, 3840).unwrap(), off);
        handle.schedule(Position::new(1, 0, 1).unwrap(), on);

        let (mut recycler, mut reclaimer) = collector(8);
        let (mut calls, _receiver) = dispatch(4);
        let mut services = Services {
            recycler: &mut recycler,
            calls: &mut calls,
        };
        let scope = ProcessScope {
            rolling: true,
            pos: Transport {
                bbt_valid: true,
                ..Transport::default()
            },
            nframes: 512,
            time: 0,
        };
        graph.process_all(&scope, &mut services);

        let out = graph.output_midi(id, 0).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], MidiEvent { frame: 0, message: on });
        assert_eq!(out[1], MidiEvent { frame: 200, message: off });
        // delivered boxes went through the collector
        assert_eq!(reclaimer.free(), 2);
    }
}
