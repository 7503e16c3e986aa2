//! Script-thread view of the graph: input registry and cycle rejection.
//!
//! Every input a node owns is registered here as an [`InputSlot`] holding a
//! shared handle to the node's connector. Connection requests walk the
//! registered inputs upstream from the proposed source; if the walk reaches
//! the target the edge is refused and nothing is mutated. Acceptance is one
//! release store into the connector, so the process thread only ever observes
//! acyclic graphs.

use std::sync::Arc;

use super::{Connector, GraphError, NodeId, PortRef};

/// One registered input of a node, by signal kind.
///
/// The kind does not affect reachability (any edge can close a loop); it
/// exists so callers cannot wire a MIDI output into an audio input.
#[derive(Debug, Clone)]
pub enum InputSlot {
    Audio(Arc<Connector>),
    Midi(Arc<Connector>),
}

impl InputSlot {
    fn connector(&self) -> &Connector {
        match self {
            InputSlot::Audio(c) | InputSlot::Midi(c) => c,
        }
    }

    fn is_audio(&self) -> bool {
        matches!(self, InputSlot::Audio(_))
    }
}

/// The script thread's ledger of nodes and their inputs.
///
/// Node ids index a fixed-capacity table shared with the process graph; ids
/// of removed nodes are reused only after the process side has dropped its
/// entry, which the engine guarantees by ordering removal commands before
/// the release.
pub struct GraphLayout {
    slots: Vec<Option<Vec<InputSlot>>>,
    free: Vec<u32>,
    limit: usize,
}

impl GraphLayout {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(limit),
            free: Vec::new(),
            limit,
        }
    }

    /// Register a node and its inputs, returning its id.
    pub fn allocate(&mut self, inputs: Vec<InputSlot>) -> Result<NodeId, GraphError> {
        if let Some(reused) = self.free.pop() {
            self.slots[reused as usize] = Some(inputs);
            return Ok(NodeId(reused));
        }
        if self.slots.len() >= self.limit {
            return Err(GraphError::TooManyNodes { limit: self.limit });
        }
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(inputs));
        Ok(id)
    }

    /// Drop a node from the ledger: clear its own connectors, disconnect
    /// every downstream input that still points at it (the id may be reused),
    /// and recycle the id.
    pub fn release(&mut self, id: NodeId) {
        let Some(inputs) = self.slots.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        for slot in &inputs {
            slot.connector().clear();
        }
        for slot in self.slots.iter().flatten().flat_map(|inputs| inputs.iter()) {
            if slot.connector().load().is_some_and(|port| port.node == id) {
                slot.connector().clear();
            }
        }
        self.free.push(id.0);
    }

    /// Connect `source` to input `input` of `target`, refusing cycles.
    ///
    /// On rejection nothing is published: the connector keeps whatever edge
    /// it held before.
    pub fn connect(
        &self,
        target: NodeId,
        input: usize,
        source: PortRef,
    ) -> Result<(), GraphError> {
        if source.node == target || self.reaches(source.node, target) {
            return Err(GraphError::CycleDetected);
        }
        let slot = self.input(target, input)?;
        slot.connector().publish(source);
        Ok(())
    }

    pub fn disconnect(&self, target: NodeId, input: usize) -> Result<(), GraphError> {
        self.input(target, input)?.connector().clear();
        Ok(())
    }

    /// Whether input `input` of `target` expects audio (as opposed to MIDI).
    pub fn input_is_audio(&self, target: NodeId, input: usize) -> Result<bool, GraphError> {
        Ok(self.input(target, input)?.is_audio())
    }

    fn input(&self, target: NodeId, input: usize) -> Result<&InputSlot, GraphError> {
        self.slots
            .get(target.index())
            .and_then(|s| s.as_ref())
            .and_then(|inputs| inputs.get(input))
            .ok_or(GraphError::NoSuchInput { input })
    }

    // upstream walk over published edges; the graph is acyclic by
    // construction so the recursion terminates
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let Some(Some(inputs)) = self.slots.get(from.index()) else {
            return false;
        };
        for slot in inputs {
            if let Some(upstream) = slot.connector().load() {
                if upstream.node == to || self.reaches(upstream.node, to) {
                    return true;
                }
            }
        }
        false
    }
}
