//! Process-thread execution of the graph.
//!
//! Nodes are pulled: each callback walks every registered node, and a node
//! asks for its upstream sources before it runs, so signal order falls out of
//! the recursion. A frame-time stamp per node makes processing idempotent
//! within a cycle; a node shared by several downstream paths still runs once.
//!
//! All storage here is fixed at registration time. The node table and the
//! output buffers are allocated on the script thread before the node crosses
//! over, and the dependency scratch vector is reserved to the node's input
//! count when it is installed; the per-cycle path never allocates.

use super::{NodeId, PortRef, ProcessScope, Processor, Services};
use crate::collect::Recycler;
use crate::midi::MidiEvent;

/// Output storage for one node, one buffer per port.
///
/// Allocated on the script thread when the node is built; the process thread
/// only reads and overwrites. Audio buffers hold one block; MIDI buffers are
/// per-cycle event lists cleared before each `do_process`.
pub struct PortBuffers {
    pub audio: Vec<Vec<f32>>,
    pub midi: Vec<Vec<MidiEvent>>,
}

impl PortBuffers {
    pub fn new(audio_ports: usize, midi_ports: usize, block_size: usize) -> Self {
        Self {
            audio: (0..audio_ports).map(|_| vec![0.0; block_size]).collect(),
            midi: (0..midi_ports).map(|_| Vec::with_capacity(64)).collect(),
        }
    }

    fn clear_midi(&mut self) {
        for list in &mut self.midi {
            list.clear();
        }
    }

    fn resize(&mut self, block_size: usize) {
        for buffer in &mut self.audio {
            buffer.resize(block_size, 0.0);
        }
    }
}

struct NodeEntry {
    node: Box<dyn Processor>,
    outputs: PortBuffers,
    // end frame-time of the last cycle this node ran in
    processed_until: u64,
    deps: Vec<PortRef>,
}

/// Read-only view of upstream outputs during one node's `do_process`.
///
/// An unconnected audio input resolves to the shared silence buffer, an
/// unconnected MIDI input to the empty list; nodes never branch on
/// connectedness.
pub struct Inputs<'a> {
    nodes: &'a [Option<NodeEntry>],
    silence: &'a [f32],
}

impl Inputs<'_> {
    pub fn audio(&self, source: Option<PortRef>) -> &[f32] {
        self.lookup_audio(source).unwrap_or(self.silence)
    }

    pub fn midi(&self, source: Option<PortRef>) -> &[MidiEvent] {
        self.lookup_midi(source).unwrap_or(&[])
    }

    fn lookup_audio(&self, source: Option<PortRef>) -> Option<&[f32]> {
        let port = source?;
        let entry = self.nodes.get(port.node.index())?.as_ref()?;
        Some(entry.outputs.audio.get(port.port as usize)?.as_slice())
    }

    fn lookup_midi(&self, source: Option<PortRef>) -> Option<&[MidiEvent]> {
        let port = source?;
        let entry = self.nodes.get(port.node.index())?.as_ref()?;
        Some(entry.outputs.midi.get(port.port as usize)?.as_slice())
    }
}

/// The live node table, owned by the process thread.
pub struct ProcessGraph {
    nodes: Vec<Option<NodeEntry>>,
    silence: Vec<f32>,
}

impl ProcessGraph {
    pub(crate) fn new(max_nodes: usize, block_size: usize) -> Self {
        Self {
            nodes: (0..max_nodes).map(|_| None).collect(),
            silence: vec![0.0; block_size],
        }
    }

    /// Install a node built on the script thread. Slot collisions cannot
    /// happen: ids are only reused after the removal command was processed.
    /// `inputs` sizes the dependency scratch vector up front, so the first
    /// `dependencies` call does not allocate.
    pub(crate) fn insert(
        &mut self,
        id: NodeId,
        node: Box<dyn Processor>,
        inputs: usize,
        outputs: PortBuffers,
    ) {
        if let Some(slot) = self.nodes.get_mut(id.index()) {
            *slot = Some(NodeEntry {
                node,
                outputs,
                processed_until: 0,
                deps: Vec::with_capacity(inputs),
            });
        }
    }

    /// Pull a node out of the table; the caller hands it to the collector.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Box<dyn Processor>> {
        let entry = self.nodes.get_mut(id.index()).and_then(Option::take)?;
        Some(entry.node)
    }

    /// Run every node exactly once for this cycle.
    pub(crate) fn process_all(&mut self, scope: &ProcessScope, services: &mut Services<'_>) {
        for idx in 0..self.nodes.len() {
            self.process_node(idx, scope, services);
        }
    }

    fn process_node(&mut self, idx: usize, scope: &ProcessScope, services: &mut Services<'_>) {
        // take the entry out of the table: its &mut and the immutable view of
        // the other nodes' outputs then coexist without aliasing
        let Some(mut entry) = self.nodes.get_mut(idx).and_then(Option::take) else {
            return;
        };
        if entry.processed_until > scope.time {
            self.nodes[idx] = Some(entry);
            return;
        }
        entry.processed_until = scope.time + u64::from(scope.nframes);

        entry.deps.clear();
        entry.node.dependencies(&mut entry.deps);
        for i in 0..entry.deps.len() {
            self.process_node(entry.deps[i].node.index(), scope, services);
        }

        entry.outputs.clear_midi();
        let inputs = Inputs {
            nodes: &self.nodes,
            silence: &self.silence,
        };
        entry.node.do_process(scope, &inputs, &mut entry.outputs, services);
        self.nodes[idx] = Some(entry);
    }

    /// Grow or shrink every block-sized buffer. Only called while the
    /// callback is parked; this allocates.
    pub(crate) fn set_buffer_size(&mut self, block_size: usize) {
        self.silence.resize(block_size, 0.0);
        self.silence.fill(0.0);
        for entry in self.nodes.iter_mut().flatten() {
            entry.outputs.resize(block_size);
        }
    }

    /// Tell every node the transport has relocated.
    pub(crate) fn reposition(&mut self, recycler: &mut Recycler) {
        for entry in self.nodes.iter_mut().flatten() {
            entry.node.reposition(recycler);
        }
    }

    /// True once every node has finished flushing after a relocation.
    pub(crate) fn reposition_complete(&self) -> bool {
        self.nodes
            .iter()
            .flatten()
            .all(|entry| entry.node.reposition_complete())
    }

    /// Read a node's audio output after a cycle (the host adapter's pull
    /// path for its physical output ports).
    pub(crate) fn output_audio(&self, id: NodeId, port: u16) -> Option<&[f32]> {
        let entry = self.nodes.get(id.index())?.as_ref()?;
        Some(entry.outputs.audio.get(port as usize)?.as_slice())
    }

    /// Read a node's MIDI output after a cycle.
    pub(crate) fn output_midi(&self, id: NodeId, port: u16) -> Option<&[MidiEvent]> {
        let entry = self.nodes.get(id.index())?.as_ref()?;
        Some(entry.outputs.midi.get(port as usize)?.as_slice())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatch;
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Ramp;

    impl Processor for Ramp {
        fn do_process(
            &mut self,
            _scope: &ProcessScope,
            _inputs: &Inputs<'_>,
            outputs: &mut PortBuffers,
            _services: &mut Services<'_>,
        ) {
            for (n, sample) in outputs.audio[0].iter_mut().enumerate() {
                *sample = n as f32;
            }
        }

        fn reposition(&mut self, _recycler: &mut Recycler) {}
    }

    struct Doubler {
        source: Option<PortRef>,
        runs: Arc<AtomicU32>,
    }

    impl Processor for Doubler {
        fn dependencies(&mut self, deps: &mut Vec<PortRef>) {
            deps.extend(self.source);
        }

        fn do_process(
            &mut self,
            _scope: &ProcessScope,
            inputs: &Inputs<'_>,
            outputs: &mut PortBuffers,
            _services: &mut Services<'_>,
        ) {
            self.runs.fetch_add(1, Ordering::Relaxed);
            let input = inputs.audio(self.source);
            for (out, sample) in outputs.audio[0].iter_mut().zip(input) {
                *out = sample * 2.0;
            }
        }

        fn reposition(&mut self, _recycler: &mut Recycler) {}
    }

    fn scope(time: u64, nframes: u32) -> ProcessScope {
        ProcessScope {
            rolling: true,
            pos: Transport::default(),
            nframes,
            time,
        }
    }

    fn run_cycle(graph: &mut ProcessGraph, time: u64, nframes: u32) {
        let (mut recycler, _reclaimer) = crate::collect::collector(8);
        let (mut calls, _receiver) = dispatch(4);
        let mut services = Services {
            recycler: &mut recycler,
            calls: &mut calls,
        };
        graph.process_all(&scope(time, nframes), &mut services);
    }

    fn port(id: NodeId) -> PortRef {
        PortRef { node: id, port: 0 }
    }

    #[test]
    fn test_pull_order_through_a_chain() {
        let mut graph = ProcessGraph::new(8, 4);
        let src = NodeId(0);
        let dbl = NodeId(1);
        graph.insert(src, Box::new(Ramp), 0, PortBuffers::new(1, 0, 4));
        let runs = Arc::new(AtomicU32::new(0));
        graph.insert(
            dbl,
            Box::new(Doubler {
                source: Some(port(src)),
                runs: runs.clone(),
            }),
            1,
            PortBuffers::new(1, 0, 4),
        );
        run_cycle(&mut graph, 0, 4);
        let out = &graph.nodes[1].as_ref().unwrap().outputs.audio[0];
        assert_eq!(out, &vec![0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_shared_node_runs_once_per_cycle() {
        let mut graph = ProcessGraph::new(8, 4);
        let runs = Arc::new(AtomicU32::new(0));
        let shared = NodeId(0);
        graph.insert(
            shared,
            Box::new(Doubler {
                source: None,
                runs: runs.clone(),
            }),
            1,
            PortBuffers::new(1, 0, 4),
        );
        for sink in 1..3 {
            graph.insert(
                NodeId(sink),
                Box::new(Doubler {
                    source: Some(port(shared)),
                    runs: Arc::new(AtomicU32::new(0)),
                }),
                1,
                PortBuffers::new(1, 0, 4),
            );
        }
        run_cycle(&mut graph, 0, 4);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        run_cycle(&mut graph, 4, 4);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unconnected_input_reads_silence() {
        let mut graph = ProcessGraph::new(4, 4);
        let runs = Arc::new(AtomicU32::new(0));
        graph.insert(
            NodeId(0),
            Box::new(Doubler {
                source: None,
                runs,
            }),
            1,
            PortBuffers::new(1, 0, 4),
        );
        run_cycle(&mut graph, 0, 4);
        let out = &graph.nodes[0].as_ref().unwrap().outputs.audio[0];
        assert_eq!(out, &vec![0.0; 4]);
    }

    #[test]
    fn test_dependency_scratch_preallocated_at_insert() {
        let mut graph = ProcessGraph::new(4, 4);
        graph.insert(NodeId(0), Box::new(Ramp), 3, PortBuffers::new(1, 0, 4));
        assert!(graph.nodes[0].as_ref().unwrap().deps.capacity() >= 3);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut graph = ProcessGraph::new(4, 4);
        graph.insert(NodeId(0), Box::new(Ramp), 0, PortBuffers::new(1, 0, 4));
        assert_eq!(graph.len(), 1);
        assert!(graph.remove(NodeId(0)).is_some());
        assert_eq!(graph.len(), 0);
        assert!(graph.remove(NodeId(0)).is_none());
    }

    #[test]
    fn test_set_buffer_size_resizes_everything() {
        let mut graph = ProcessGraph::new(4, 4);
        graph.insert(NodeId(0), Box::new(Ramp), 0, PortBuffers::new(1, 0, 4));
        graph.set_buffer_size(16);
        run_cycle(&mut graph, 0, 16);
        let out = &graph.nodes[0].as_ref().unwrap().outputs.audio[0];
        assert_eq!(out.len(), 16);
        assert_eq!(out[15], 15.0);
    }
}
