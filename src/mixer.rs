//! The gain-matrix mixer.
//!
//! Not interesting as DSP; interesting because it touches every primitive the
//! substrate offers. Gains change three ways, each over its own channel: an
//! immediate set crosses on the control queue, a musically scheduled change
//! rides an event buffer and lands frame-accurately inside the block, and a
//! MIDI controller mapping reads the control input each cycle. The script
//! half ([`MixerHandle`]) survives in the processor cache across runs; the
//! process half ([`MixerNode`]) never stops running while the handle is
//! reused.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cache::CachedHandle;
use crate::collect::Recycler;
use crate::event::{event_buffer, EventBufferConfig, EventQueue, EventWriter, ScheduledEvent};
use crate::graph::{
    Connector, GraphError, GraphLayout, InputSlot, Inputs, NodeId, PortBuffers, PortRef,
    ProcessScope, Processor, Services,
};
use crate::midi::MidiMessage;
use crate::queue::{spsc, QueueList, QueueReader, QueueWriter};
use crate::time::Position;

/// A gain change scheduled at a musical position.
struct GainEvent {
    position: Position,
    input: u16,
    output: u16,
    gain: f32,
}

impl ScheduledEvent for GainEvent {
    fn position(&self) -> Position {
        self.position
    }
}

// script-to-node control traffic: small copyable values, no boxing

#[derive(Clone, Copy)]
struct GainSet {
    input: u16,
    output: u16,
    gain: f32,
}

#[derive(Clone, Copy)]
struct ControlMapping {
    controller: u8,
    input: u16,
    output: u16,
}

/// The input slots a mixer of this width registers with the layout:
/// one audio connector per input, then one MIDI connector for controllers.
pub(crate) fn input_slots(inputs: u16) -> Vec<InputSlot> {
    (0..inputs)
        .map(|_| InputSlot::Audio(Arc::new(Connector::new())))
        .chain(std::iter::once(InputSlot::Midi(Arc::new(Connector::new()))))
        .collect()
}

/// Build both halves of a mixer around an already-allocated node id.
pub(crate) fn mixer(
    node: NodeId,
    inputs: u16,
    outputs: u16,
    slots: &[InputSlot],
    config: EventBufferConfig,
    control_capacity: usize,
) -> (MixerHandle, MixerNode) {
    let (writer, events) = event_buffer(config);
    let (gains_tx, gains_rx) = spsc(control_capacity);
    let (mappings_tx, mappings_rx) = spsc(control_capacity);
    let connectors: Vec<Arc<Connector>> = slots
        .iter()
        .map(|slot| match slot {
            InputSlot::Audio(c) | InputSlot::Midi(c) => c.clone(),
        })
        .collect();
    let (audio_in, control_in) = {
        let mut all = connectors;
        let control = all
            .pop()
            .unwrap_or_else(|| Arc::new(Connector::new()));
        (all, control)
    };
    (
        MixerHandle {
            node,
            inputs,
            outputs,
            writer,
            gains: gains_tx,
            mappings: mappings_tx,
            controllers: HashSet::new(),
        },
        MixerNode {
            inputs,
            outputs,
            gains: vec![0.0; inputs as usize * outputs as usize],
            audio_in,
            control_in,
            sources: vec![None; inputs as usize],
            control_source: None,
            events,
            gains_rx,
            mappings: QueueList::new(mappings_rx, control_capacity),
        },
    )
}

/// Script-thread handle to a live mixer.
pub struct MixerHandle {
    node: NodeId,
    inputs: u16,
    outputs: u16,
    writer: EventWriter<GainEvent>,
    gains: QueueWriter<GainSet>,
    mappings: QueueWriter<ControlMapping>,
    // controllers added this run, so a rerun cannot double-map
    controllers: HashSet<(u8, u16, u16)>,
}

impl MixerHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn inputs(&self) -> u16 {
        self.inputs
    }

    pub fn outputs(&self) -> u16 {
        self.outputs
    }

    /// Wire an audio source into one input and seed its row of the gain
    /// matrix, one gain per output.
    pub fn connect(
        &mut self,
        layout: &GraphLayout,
        source: PortRef,
        input: u16,
        gains: &[f32],
    ) -> Result<(), MixerError> {
        self.check_input(input)?;
        if gains.len() != self.outputs as usize {
            return Err(MixerError::ChannelMismatch {
                expected: self.outputs,
                got: gains.len(),
            });
        }
        layout.connect(self.node, input as usize, source)?;
        for (output, gain) in gains.iter().enumerate() {
            self.gains.send(GainSet {
                input,
                output: output as u16,
                gain: *gain,
            });
        }
        Ok(())
    }

    /// Wire a MIDI source into the controller input.
    pub fn connect_midi_control(
        &mut self,
        layout: &GraphLayout,
        source: PortRef,
    ) -> Result<(), MixerError> {
        layout.connect(self.node, self.inputs as usize, source)?;
        Ok(())
    }

    /// Set one matrix cell, effective next cycle.
    pub fn set_gain(&mut self, input: u16, output: u16, gain: f32) -> Result<(), MixerError> {
        self.check_input(input)?;
        self.check_output(output)?;
        self.gains.send(GainSet {
            input,
            output,
            gain,
        });
        Ok(())
    }

    /// Schedule a gain change at a musical position, frame-accurate.
    pub fn schedule_gain(
        &mut self,
        input: u16,
        output: u16,
        gain: f32,
        position: Position,
    ) -> Result<(), MixerError> {
        self.check_input(input)?;
        self.check_output(output)?;
        self.writer.schedule(GainEvent {
            position,
            input,
            output,
            gain,
        });
        Ok(())
    }

    /// Map a MIDI controller to one matrix cell. Adding the same mapping
    /// twice in one run is a no-op, so scripts can be rerun verbatim.
    pub fn add_gain_controller(
        &mut self,
        controller: u8,
        input: u16,
        output: u16,
    ) -> Result<(), MixerError> {
        if controller == 0 {
            return Err(MixerError::ZeroController);
        }
        if controller > 127 {
            return Err(MixerError::BadController(controller));
        }
        self.check_input(input)?;
        self.check_output(output)?;
        if self.controllers.insert((controller, input, output)) {
            self.mappings.send(ControlMapping {
                controller,
                input,
                output,
            });
        }
        Ok(())
    }

    fn check_input(&self, input: u16) -> Result<(), MixerError> {
        if input >= self.inputs {
            return Err(MixerError::BadInput {
                input,
                inputs: self.inputs,
            });
        }
        Ok(())
    }

    fn check_output(&self, output: u16) -> Result<(), MixerError> {
        if output >= self.outputs {
            return Err(MixerError::BadOutput {
                output,
                outputs: self.outputs,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    fn controller_count(&self) -> usize {
        self.controllers.len()
    }
}

impl CachedHandle for MixerHandle {
    fn restore(&mut self) {
        // a fresh run re-declares its controller mappings from scratch
        self.controllers.clear();
    }

    fn node(&self) -> NodeId {
        self.node
    }
}

/// Process-thread half of the mixer.
pub struct MixerNode {
    inputs: u16,
    outputs: u16,
    // row-major: gains[input * outputs + output]
    gains: Vec<f32>,
    audio_in: Vec<Arc<Connector>>,
    control_in: Arc<Connector>,
    sources: Vec<Option<PortRef>>,
    control_source: Option<PortRef>,
    events: EventQueue<GainEvent>,
    gains_rx: QueueReader<GainSet>,
    mappings: QueueList<ControlMapping>,
}

impl MixerNode {
    fn cell(&self, input: u16, output: u16) -> usize {
        input as usize * self.outputs as usize + output as usize
    }

    fn apply_controllers(&mut self, inputs: &Inputs<'_>) {
        let messages = inputs.midi(self.control_source);
        for mapping in self.mappings.iter() {
            for event in messages {
                if let MidiMessage::ControlChange {
                    controller, value, ..
                } = event.message
                {
                    if controller == mapping.controller {
                        let idx = mapping.input as usize * self.outputs as usize
                            + mapping.output as usize;
                        self.gains[idx] = f32::from(value) / 127.0;
                    }
                }
            }
        }
    }

    fn mix(&self, inputs: &Inputs<'_>, outputs: &mut PortBuffers, from: u32, to: u32) {
        let (from, to) = (from as usize, to as usize);
        if from >= to {
            return;
        }
        for out in 0..self.outputs as usize {
            outputs.audio[out][from..to].fill(0.0);
        }
        for (input, source) in self.sources.iter().enumerate() {
            let buffer = inputs.audio(*source);
            for out in 0..self.outputs as usize {
                let gain = self.gains[input * self.outputs as usize + out];
                if gain == 0.0 {
                    continue;
                }
                for (dst, src) in outputs.audio[out][from..to]
                    .iter_mut()
                    .zip(&buffer[from..to])
                {
                    *dst += src * gain;
                }
            }
        }
    }
}

impl Processor for MixerNode {
    fn dependencies(&mut self, deps: &mut Vec<PortRef>) {
        while let Some(set) = self.gains_rx.try_recv() {
            let idx = self.cell(set.input, set.output);
            self.gains[idx] = set.gain;
        }
        self.mappings.drain_fresh();
        for (slot, connector) in self.sources.iter_mut().zip(&self.audio_in) {
            *slot = connector.load();
            deps.extend(*slot);
        }
        self.control_source = self.control_in.load();
        deps.extend(self.control_source);
    }

    fn do_process(
        &mut self,
        scope: &ProcessScope,
        inputs: &Inputs<'_>,
        outputs: &mut PortBuffers,
        services: &mut Services<'_>,
    ) {
        self.apply_controllers(inputs);

        // mix in segments, retuning the matrix at each due gain event
        let nframes = scope.nframes;
        let mut frame = 0u32;
        while let Some(due) =
            self.events
                .next_event(scope.rolling, &scope.pos, nframes, services.recycler)
        {
            let at = due.offset.clamp(0, i64::from(nframes)) as u32;
            if at > frame {
                self.mix(inputs, outputs, frame, at);
                frame = at;
            }
            let idx = self.cell(due.event.input, due.event.output);
            self.gains[idx] = due.event.gain;
            services.recycler.recycle(due.event);
        }
        self.mix(inputs, outputs, frame, nframes);
    }

    fn reposition(&mut self, recycler: &mut Recycler) {
        self.events.recycle_remaining(recycler);
        // control traffic is plain values: dropping them touches no allocator
        while self.gains_rx.try_recv().is_some() {}
        self.mappings.clear();
    }
}

/// Script-visible mixer misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerError {
    BadInput { input: u16, inputs: u16 },
    BadOutput { output: u16, outputs: u16 },
    ChannelMismatch { expected: u16, got: usize },
    ZeroController,
    BadController(u8),
    Graph(GraphError),
}

impl fmt::Display for MixerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MixerError::BadInput { input, inputs } => {
                write!(f, "no input {input} on a {inputs}-input mixer")
            }
            MixerError::BadOutput { output, outputs } => {
                write!(f, "no output {output} on a {outputs}-output mixer")
            }
            MixerError::ChannelMismatch { expected, got } => {
                write!(f, "expected {expected} gain values, got {got}")
            }
            MixerError::ZeroController => write!(f, "controller number cannot be zero"),
            MixerError::BadController(c) => write!(f, "invalid controller number {c}"),
            MixerError::Graph(err) => err.fmt(f),
        }
    }
}

impl From<GraphError> for MixerError {
    fn from(err: GraphError) -> Self {
        MixerError::Graph(err)
    }
}

impl std::error::Error for MixerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MixerError::Graph(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{collector, Reclaimer};
    use crate::dispatch::dispatch;
    use crate::graph::ProcessGraph;
    use crate::midi::MidiEvent;
    use crate::transport::Transport;

    struct ConstSource(f32);

    impl Processor for ConstSource {
        fn do_process(
            &mut self,
            _scope: &ProcessScope,
            _inputs: &Inputs<'_>,
            outputs: &mut PortBuffers,
            _services: &mut Services<'_>,
        ) {
            outputs.audio[0].fill(self.0);
        }

        fn reposition(&mut self, _recycler: &mut Recycler) {}
    }

    struct CcSource {
        message: MidiMessage,
    }

    impl Processor for CcSource {
        fn do_process(
            &mut self,
            _scope: &ProcessScope,
            _inputs: &Inputs<'_>,
            outputs: &mut PortBuffers,
            _services: &mut Services<'_>,
        ) {
            outputs.midi[0].push(MidiEvent {
                frame: 0,
                message: self.message,
            });
        }

        fn reposition(&mut self, _recycler: &mut Recycler) {}
    }

    const BLOCK: usize = 512;

    struct Rig {
        layout: GraphLayout,
        graph: ProcessGraph,
        recycler: Recycler,
        reclaimer: Reclaimer,
    }

    impl Rig {
        fn new() -> Self {
            let (recycler, reclaimer) = collector(32);
            Self {
                layout: GraphLayout::new(16),
                graph: ProcessGraph::new(16, BLOCK),
                recycler,
                reclaimer,
            }
        }

        fn add_mixer(&mut self, inputs: u16, outputs: u16) -> MixerHandle {
            let slots = input_slots(inputs);
            let id = self.layout.allocate(slots.clone()).unwrap();
            let (handle, node) =
                mixer(id, inputs, outputs, &slots, EventBufferConfig::default(), 32);
            self.graph.insert(
                id,
                Box::new(node),
                slots.len(),
                PortBuffers::new(outputs as usize, 0, BLOCK),
            );
            handle
        }

        fn add_source(&mut self, level: f32) -> PortRef {
            let id = self.layout.allocate(Vec::new()).unwrap();
            self.graph
                .insert(id, Box::new(ConstSource(level)), 0, PortBuffers::new(1, 0, BLOCK));
            PortRef { node: id, port: 0 }
        }

        fn add_cc_source(&mut self, message: MidiMessage) -> PortRef {
            let id = self.layout.allocate(Vec::new()).unwrap();
            self.graph.insert(
                id,
                Box::new(CcSource { message }),
                0,
                PortBuffers::new(0, 1, BLOCK),
            );
            PortRef { node: id, port: 0 }
        }

        fn run_cycle(&mut self, time: u64) {
            let (mut calls, _receiver) = dispatch(4);
            let mut services = Services {
                recycler: &mut self.recycler,
                calls: &mut calls,
            };
            let scope = ProcessScope {
                rolling: true,
                pos: Transport {
                    bbt_valid: true,
                    ..Transport::default()
                },
                nframes: BLOCK as u32,
                time,
            };
            self.graph.process_all(&scope, &mut services);
        }

        fn output(&self, handle: &MixerHandle, port: u16) -> &[f32] {
            self.graph.output_audio(handle.node(), port).unwrap()
        }
    }

    #[test]
    fn test_matrix_gain_applied() {
        let mut rig = Rig::new();
        let mut mixer = rig.add_mixer(2, 1);
        let src = rig.add_source(1.0);
        mixer.connect(&rig.layout, src, 0, &[0.5]).unwrap();
        rig.run_cycle(0);
        assert_eq!(rig.output(&mixer, 0)[0], 0.5);
        assert_eq!(rig.output(&mixer, 0)[BLOCK - 1], 0.5);
    }

    #[test]
    fn test_scheduled_gain_lands_mid_block() {
        let mut rig = Rig::new();
        let mut mixer = rig.add_mixer(1, 1);
        let src = rig.add_source(1.0);
        mixer.connect(&rig.layout, src, 0, &[1.0]).unwrap();
        // 8/3840 of a bar = 16 ticks = 200 frames at 48k/120bpm/1920tpb
        let at = Position::new(1, 8, 3840).unwrap();
        mixer.schedule_gain(0, 0, 0.0, at).unwrap();
        rig.run_cycle(0);
        let out = rig.output(&mixer, 0);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[199], 1.0);
        assert_eq!(out[200], 0.0);
        assert_eq!(out[BLOCK - 1], 0.0);
    }

    #[test]
    fn test_controller_mapping_drives_gain() {
        let mut rig = Rig::new();
        let mut mixer = rig.add_mixer(1, 1);
        let src = rig.add_source(1.0);
        mixer.connect(&rig.layout, src, 0, &[0.0]).unwrap();
        let cc = rig.add_cc_source(MidiMessage::control_change(1, 7, 127).unwrap());
        mixer.connect_midi_control(&rig.layout, cc).unwrap();
        mixer.add_gain_controller(7, 0, 0).unwrap();
        rig.run_cycle(0);
        assert_eq!(rig.output(&mixer, 0)[0], 1.0);
    }

    #[test]
    fn test_duplicate_controller_is_a_noop_until_restore() {
        let mut rig = Rig::new();
        let mut mixer = rig.add_mixer(1, 1);
        mixer.add_gain_controller(7, 0, 0).unwrap();
        mixer.add_gain_controller(7, 0, 0).unwrap();
        assert_eq!(mixer.controller_count(), 1);
        mixer.restore();
        assert_eq!(mixer.controller_count(), 0);
        mixer.add_gain_controller(7, 0, 0).unwrap();
        assert_eq!(mixer.controller_count(), 1);
    }

    #[test]
    fn test_validation_errors() {
        let mut rig = Rig::new();
        let mut mixer = rig.add_mixer(2, 2);
        let src = rig.add_source(1.0);
        assert!(matches!(
            mixer.connect(&rig.layout, src, 5, &[0.0, 0.0]),
            Err(MixerError::BadInput { input: 5, inputs: 2 })
        ));
        assert!(matches!(
            mixer.connect(&rig.layout, src, 0, &[0.0]),
            Err(MixerError::ChannelMismatch { expected: 2, got: 1 })
        ));
        assert_eq!(
            mixer.add_gain_controller(0, 0, 0),
            Err(MixerError::ZeroController)
        );
        assert!(matches!(
            mixer.set_gain(0, 9, 1.0),
            Err(MixerError::BadOutput { output: 9, outputs: 2 })
        ));
    }

    #[test]
    fn test_reposition_recycles_scheduled_gains() {
        let mut rig = Rig::new();
        let mut mixer = rig.add_mixer(1, 1);
        let far = Position::new(100, 0, 1).unwrap();
        mixer.schedule_gain(0, 0, 0.3, far).unwrap();
        mixer.schedule_gain(0, 0, 0.7, far).unwrap();
        rig.graph.reposition(&mut rig.recycler);
        assert_eq!(rig.reclaimer.free(), 2);
        assert!(rig.graph.reposition_complete());
    }
}
