//! The engine: two halves of one machine.
//!
//! [`audio_engine`] splits the world along the thread boundary once, at
//! construction. [`ProcessEngine`] is wired into the host's callbacks
//! (`process`, `sync`, buffer-size changes, optionally the timebase);
//! [`ScriptContext`] belongs to the script thread and owns everything that
//! may allocate or block: the graph ledger, the caches, the handler registry
//! and the reclaiming side of the collector.
//!
//! The two halves coordinate through bounded queues and three shared flags
//! (`abort`, `restart`, `running`) that drive the reposition handshake: when
//! the transport relocates, the process side tells the script to abort, holds
//! the transport in `sync` until the script has stopped and every node has
//! flushed, then flips `restart` and lets the host roll.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{ObjectCache, ProcessorCache};
use crate::collect::{collector, Recycler, Reclaimer};
use crate::dispatch::{dispatch, CallReceiver, CallSender, DispatchError, Handler, HandlerId};
use crate::event::EventBufferConfig;
use crate::graph::{
    GraphError, GraphLayout, InputSlot, NodeId, PortBuffers, PortRef, ProcessGraph, ProcessScope,
    Processor, Services,
};
use crate::midi::{midi_output, MidiEvent, MidiMessage, MidiOutputHandle};
use crate::mixer::{self, MixerError, MixerHandle};
use crate::queue::{spsc, QueueReader, QueueWriter};
use crate::time::Position;
use crate::transport::{Transport, TransportMaster, TransportState};

/// Sizing and tuning for one engine instance.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub block_size: usize,
    /// Fixed capacity of the node table.
    pub max_nodes: usize,
    pub command_capacity: usize,
    pub collector_capacity: usize,
    pub dispatch_capacity: usize,
    /// Per-mixer control queue depth.
    pub control_capacity: usize,
    pub event_buffer: EventBufferConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            max_nodes: 64,
            command_capacity: 64,
            collector_capacity: 128,
            dispatch_capacity: 64,
            control_capacity: 32,
            event_buffer: EventBufferConfig::default(),
        }
    }
}

// reposition handshake flags, shared by both halves
#[derive(Default)]
struct EngineShared {
    abort: AtomicBool,
    restart: AtomicBool,
    running: AtomicBool,
}

enum GraphCommand {
    Add {
        id: NodeId,
        node: Box<dyn Processor>,
        inputs: usize,
        outputs: PortBuffers,
    },
    Remove {
        id: NodeId,
    },
    SetMaster(Box<TransportMaster>),
    ClearMaster,
    MasterTempo {
        bpm: f64,
        force_beat: bool,
    },
    MasterMeter {
        beats_per_bar: f64,
        beat_unit: f64,
    },
}

/// Build an engine, returning the script half and the process half.
pub fn audio_engine(config: EngineConfig) -> (ScriptContext, ProcessEngine) {
    let (command_tx, command_rx) = spsc(config.command_capacity);
    let (recycler, reclaimer) = collector(config.collector_capacity);
    let (calls_tx, calls_rx) = dispatch(config.dispatch_capacity);
    let shared = Arc::new(EngineShared::default());
    (
        ScriptContext {
            layout: GraphLayout::new(config.max_nodes),
            commands: command_tx,
            reclaimer,
            calls: calls_rx,
            shared: shared.clone(),
            config,
            mixers: ProcessorCache::new(),
            midi_outputs: ProcessorCache::new(),
            master: MasterCache::default(),
        },
        ProcessEngine {
            commands: command_rx,
            graph: ProcessGraph::new(config.max_nodes, config.block_size),
            recycler,
            calls: calls_tx,
            shared,
            master: None,
            reposition: RepositionState::Idle,
            last_frame: 0,
            time: 0,
        },
    )
}

#[derive(Default)]
struct MasterCache {
    installed: bool,
    referenced: bool,
}

/// Script-thread half: graph construction, caches, run lifecycle.
pub struct ScriptContext {
    layout: GraphLayout,
    commands: QueueWriter<GraphCommand>,
    reclaimer: Reclaimer,
    calls: CallReceiver,
    shared: Arc<EngineShared>,
    config: EngineConfig,
    mixers: ProcessorCache<MixerHandle>,
    midi_outputs: ProcessorCache<MidiOutputHandle>,
    master: MasterCache,
}

impl ScriptContext {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The connection ledger, for wiring handles up directly.
    pub fn graph(&self) -> &GraphLayout {
        &self.layout
    }

    /// Fetch (or build) the next `inputs`x`outputs` mixer of this run.
    pub fn mixer(&mut self, inputs: u16, outputs: u16) -> Result<NodeId, EngineError> {
        let Self {
            layout,
            commands,
            config,
            mixers,
            ..
        } = self;
        let shape = (u64::from(inputs) << 16) | u64::from(outputs);
        let handle = mixers.acquire(shape, || {
            let slots = mixer::input_slots(inputs);
            let id = layout.allocate(slots.clone())?;
            let (handle, node) = mixer::mixer(
                id,
                inputs,
                outputs,
                &slots,
                config.event_buffer,
                config.control_capacity,
            );
            commands.send(GraphCommand::Add {
                id,
                node: Box::new(node),
                inputs: slots.len(),
                outputs: PortBuffers::new(usize::from(outputs), 0, config.block_size),
            });
            log::debug!("registered {inputs}x{outputs} mixer as node {}", id.index());
            Ok::<_, EngineError>(handle)
        })?;
        Ok(handle.node())
    }

    /// Fetch (or build) the next MIDI output of this run.
    pub fn midi_output(&mut self) -> Result<NodeId, EngineError> {
        let Self {
            layout,
            commands,
            config,
            midi_outputs,
            ..
        } = self;
        let handle = midi_outputs.acquire(0, || {
            let id = layout.allocate(Vec::new())?;
            let (handle, node) = midi_output(id, config.event_buffer);
            commands.send(GraphCommand::Add {
                id,
                node: Box::new(node),
                inputs: 0,
                outputs: PortBuffers::new(0, 1, config.block_size),
            });
            Ok::<_, EngineError>(handle)
        })?;
        Ok(handle.node())
    }

    /// Register a custom node outside the caches. Meant for host-lifetime
    /// adapters (physical input/output ports); it is never swept between
    /// runs, only removed explicitly.
    pub fn add_node(
        &mut self,
        node: Box<dyn Processor>,
        inputs: Vec<InputSlot>,
        audio_outputs: u16,
        midi_outputs: u16,
    ) -> Result<NodeId, EngineError> {
        let input_count = inputs.len();
        let id = self.layout.allocate(inputs)?;
        self.commands.send(GraphCommand::Add {
            id,
            node,
            inputs: input_count,
            outputs: PortBuffers::new(
                usize::from(audio_outputs),
                usize::from(midi_outputs),
                self.config.block_size,
            ),
        });
        Ok(id)
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.commands.send(GraphCommand::Remove { id });
        self.layout.release(id);
    }

    /// Wire a source port into a node input, refusing cycles.
    pub fn connect(
        &mut self,
        source: PortRef,
        target: NodeId,
        input: usize,
    ) -> Result<(), EngineError> {
        self.layout.connect(target, input, source)?;
        Ok(())
    }

    pub fn disconnect(&mut self, target: NodeId, input: usize) -> Result<(), EngineError> {
        self.layout.disconnect(target, input)?;
        Ok(())
    }

    pub fn mixer_connect(
        &mut self,
        mixer: NodeId,
        source: PortRef,
        input: u16,
        gains: &[f32],
    ) -> Result<(), EngineError> {
        let handle = self
            .mixers
            .get_by_node(mixer)
            .ok_or(EngineError::UnknownNode)?;
        handle.connect(&self.layout, source, input, gains)?;
        Ok(())
    }

    pub fn mixer_connect_midi_control(
        &mut self,
        mixer: NodeId,
        source: PortRef,
    ) -> Result<(), EngineError> {
        let handle = self
            .mixers
            .get_by_node(mixer)
            .ok_or(EngineError::UnknownNode)?;
        handle.connect_midi_control(&self.layout, source)?;
        Ok(())
    }

    pub fn mixer_set_gain(
        &mut self,
        mixer: NodeId,
        input: u16,
        output: u16,
        gain: f32,
    ) -> Result<(), EngineError> {
        self.mixer_handle(mixer)?.set_gain(input, output, gain)?;
        Ok(())
    }

    pub fn mixer_schedule_gain(
        &mut self,
        mixer: NodeId,
        input: u16,
        output: u16,
        gain: f32,
        position: Position,
    ) -> Result<(), EngineError> {
        self.mixer_handle(mixer)?
            .schedule_gain(input, output, gain, position)?;
        Ok(())
    }

    pub fn mixer_add_gain_controller(
        &mut self,
        mixer: NodeId,
        controller: u8,
        input: u16,
        output: u16,
    ) -> Result<(), EngineError> {
        self.mixer_handle(mixer)?
            .add_gain_controller(controller, input, output)?;
        Ok(())
    }

    /// Schedule a MIDI message on an output created by [`midi_output`].
    ///
    /// [`midi_output`]: ScriptContext::midi_output
    pub fn schedule_midi(
        &mut self,
        output: NodeId,
        position: Position,
        message: MidiMessage,
    ) -> Result<(), EngineError> {
        self.midi_outputs
            .get_by_node(output)
            .ok_or(EngineError::UnknownNode)?
            .schedule(position, message);
        Ok(())
    }

    fn mixer_handle(&mut self, mixer: NodeId) -> Result<&mut MixerHandle, EngineError> {
        self.mixers
            .get_by_node(mixer)
            .ok_or(EngineError::UnknownNode)
    }

    /// Install (or re-reference) the timebase master for this run.
    pub fn transport_master(&mut self, bpm: f64, beats_per_bar: f64, beat_unit: f64) {
        if self.master.installed {
            self.commands.send(GraphCommand::MasterTempo {
                bpm,
                force_beat: false,
            });
            self.commands.send(GraphCommand::MasterMeter {
                beats_per_bar,
                beat_unit,
            });
        } else {
            self.commands.send(GraphCommand::SetMaster(Box::new(
                TransportMaster::new(bpm, beats_per_bar, beat_unit),
            )));
            self.master.installed = true;
        }
        self.master.referenced = true;
    }

    /// Change tempo on the installed master, optionally snapping the next
    /// period to a beat boundary.
    pub fn set_tempo(&mut self, bpm: f64, force_beat: bool) -> Result<(), EngineError> {
        if !self.master.installed {
            return Err(EngineError::NoMaster);
        }
        self.commands.send(GraphCommand::MasterTempo { bpm, force_beat });
        Ok(())
    }

    /// Register a script callback for the process thread to invoke.
    pub fn register_handler(
        &mut self,
        required_args: u8,
        handler: Handler,
    ) -> Result<HandlerId, DispatchError> {
        self.calls.register(required_args, handler)
    }

    /// Invoke queued callbacks; part of the script thread's idle loop.
    pub fn dispatch_calls(&mut self) -> usize {
        self.calls.drain()
    }

    /// Drop whatever the process thread has retired; the other idle duty.
    pub fn free_collected(&mut self) -> usize {
        self.reclaimer.free()
    }

    /// A script run is starting.
    pub fn begin_run(&mut self) {
        self.shared.running.store(true, Ordering::Release);
    }

    /// The process side wants the current run abandoned (reposition).
    pub fn should_abort(&self) -> bool {
        self.shared.abort.load(Ordering::Acquire)
    }

    /// Consume a pending restart request, if any.
    pub fn poll_restart(&mut self) -> bool {
        self.shared.restart.swap(false, Ordering::AcqRel)
    }

    /// A script run finished: reconcile the caches, retire nodes the run no
    /// longer wants, clear `running`. Returns whether live objects remain.
    pub fn script_complete(&mut self) -> bool {
        let mut removed = Vec::new();
        self.mixers.script_complete(&mut removed);
        self.midi_outputs.script_complete(&mut removed);
        for id in &removed {
            self.commands.send(GraphCommand::Remove { id: *id });
            self.layout.release(*id);
        }
        if !removed.is_empty() {
            log::debug!("run complete, {} cached nodes retired", removed.len());
        }
        if self.master.installed && !self.master.referenced {
            self.commands.send(GraphCommand::ClearMaster);
            self.master.installed = false;
        }
        self.master.referenced = false;
        self.shared.running.store(false, Ordering::Release);
        !self.mixers.is_empty() || !self.midi_outputs.is_empty() || self.master.installed
    }
}

enum RepositionState {
    Idle,
    Pending { attempt: u32 },
}

/// Process-thread half: the host callback surface.
pub struct ProcessEngine {
    commands: QueueReader<GraphCommand>,
    graph: ProcessGraph,
    recycler: Recycler,
    calls: CallSender,
    shared: Arc<EngineShared>,
    master: Option<Box<TransportMaster>>,
    reposition: RepositionState,
    // last frame observed, for backward-jump detection
    last_frame: u64,
    // monotonic frame time; never jumps, unlike the transport
    time: u64,
}

impl ProcessEngine {
    /// The host process callback body.
    pub fn process(&mut self, rolling: bool, pos: &Transport, nframes: u32) {
        self.apply_commands();
        if matches!(self.reposition, RepositionState::Idle) {
            let scope = ProcessScope {
                rolling,
                pos: *pos,
                nframes,
                time: self.time,
            };
            let mut services = Services {
                recycler: &mut self.recycler,
                calls: &mut self.calls,
            };
            self.graph.process_all(&scope, &mut services);
        }
        self.time += u64::from(nframes);
        if rolling {
            // a stopped host repeats the same frame; only track real motion,
            // or a plain resume would look like a backward jump
            self.last_frame = pos.frame + u64::from(nframes);
        }
        self.recycler.flush();
        self.calls.flush();
    }

    /// The host sync callback: may the transport roll from this position?
    ///
    /// Starting from anywhere but the last observed frame, or any backward
    /// jump, begins the reposition handshake; until it completes this keeps
    /// answering `false` and the host keeps the transport parked.
    pub fn sync(&mut self, state: TransportState, pos: &Transport) -> bool {
        match self.reposition {
            RepositionState::Idle => {
                let relocated = pos.frame < self.last_frame
                    || (state == TransportState::Starting && pos.frame != self.last_frame);
                self.last_frame = pos.frame;
                if !relocated {
                    return true;
                }
                log::debug!("transport relocating to frame {}", pos.frame);
                self.shared.restart.store(false, Ordering::Release);
                self.shared.abort.store(true, Ordering::Release);
                self.graph.reposition(&mut self.recycler);
                self.reposition = RepositionState::Pending { attempt: 1 };
                false
            }
            RepositionState::Pending { attempt } => {
                self.last_frame = pos.frame;
                self.graph.reposition(&mut self.recycler);
                if self.shared.running.load(Ordering::Acquire)
                    || !self.graph.reposition_complete()
                {
                    self.reposition = RepositionState::Pending {
                        attempt: attempt + 1,
                    };
                    return false;
                }
                log::debug!("reposition complete after {attempt} sync attempts");
                self.shared.abort.store(false, Ordering::Release);
                self.shared.restart.store(true, Ordering::Release);
                self.reposition = RepositionState::Idle;
                true
            }
        }
    }

    /// Host buffer-size-changed callback. Allocates; the host guarantees the
    /// process callback is not running concurrently.
    pub fn set_buffer_size(&mut self, block_size: usize) {
        log::info!("buffer size changed to {block_size} frames");
        self.graph.set_buffer_size(block_size);
    }

    /// Host timebase callback; returns false when no master is installed.
    pub fn master_set_time(&mut self, nframes: u32, pos: &mut Transport, new_pos: bool) -> bool {
        match &mut self.master {
            Some(master) => {
                master.set_time(nframes, pos, new_pos);
                true
            }
            None => false,
        }
    }

    /// Read a node's audio output after a cycle (host output adapter path).
    pub fn output_audio(&self, node: NodeId, port: u16) -> Option<&[f32]> {
        self.graph.output_audio(node, port)
    }

    /// Read a node's MIDI output after a cycle.
    pub fn output_midi(&self, node: NodeId, port: u16) -> Option<&[MidiEvent]> {
        self.graph.output_midi(node, port)
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.try_recv() {
            match command {
                GraphCommand::Add {
                    id,
                    node,
                    inputs,
                    outputs,
                } => {
                    self.graph.insert(id, node, inputs, outputs);
                }
                GraphCommand::Remove { id } => {
                    if let Some(node) = self.graph.remove(id) {
                        // rebox so the payload is a plain Send object; the
                        // actual drop happens on the script thread
                        self.recycler.recycle(Box::new(node));
                    }
                }
                GraphCommand::SetMaster(master) => {
                    if let Some(old) = self.master.replace(master) {
                        self.recycler.recycle(old);
                    }
                }
                GraphCommand::ClearMaster => {
                    if let Some(old) = self.master.take() {
                        self.recycler.recycle(old);
                    }
                }
                GraphCommand::MasterTempo { bpm, force_beat } => {
                    if let Some(master) = &mut self.master {
                        if force_beat {
                            master.force_beat(bpm);
                        } else {
                            master.set_bpm(bpm);
                        }
                    }
                }
                GraphCommand::MasterMeter {
                    beats_per_bar,
                    beat_unit,
                } => {
                    if let Some(master) = &mut self.master {
                        master.set_time_signature(beats_per_bar, beat_unit);
                    }
                }
            }
        }
    }
}

/// Errors raised at the engine's script-facing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    Graph(GraphError),
    Mixer(MixerError),
    /// The node id does not belong to a cached handle of that kind.
    UnknownNode,
    /// Tempo operations need a transport master installed first.
    NoMaster,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Graph(err) => err.fmt(f),
            EngineError::Mixer(err) => err.fmt(f),
            EngineError::UnknownNode => write!(f, "no such node"),
            EngineError::NoMaster => write!(f, "no transport master installed"),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        EngineError::Graph(err)
    }
}

impl From<MixerError> for EngineError {
    fn from(err: MixerError) -> Self {
        EngineError::Mixer(err)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Graph(err) => Some(err),
            EngineError::Mixer(err) => Some(err),
            _ => None,
        }
    }
}
