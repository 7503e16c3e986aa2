//! The audio/MIDI connection graph.
//!
//! The graph is split along the thread boundary. [`layout::GraphLayout`] lives
//! on the script thread and performs the one synchronous safety check (cycle
//! rejection) before any connection is published. [`process::ProcessGraph`]
//! lives on the process thread and pulls each node through its published
//! connections, bounded and acyclic by construction, so the hot path never
//! checks for cycles.
//!
//! A [`Connector`] is the hand-off point between the two: a single-slot atomic
//! written only by the script thread and read by anyone. A connection's source
//! node is never freed while reachable; retirement goes through the cache and
//! the collector, both of which outlive any published pointer to the node.

pub mod layout;
pub mod process;

pub use layout::{GraphLayout, InputSlot};
pub use process::{Inputs, PortBuffers, ProcessGraph};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::collect::Recycler;
use crate::dispatch::CallSender;
use crate::transport::Transport;

/// Identity of a registered graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One output port of one node; what a connection points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub node: NodeId,
    pub port: u16,
}

/// Single-writer connection slot.
///
/// The script thread publishes with one release store after the cycle check
/// accepted the edge; the process thread reads with one acquire load. Carries
/// audio and MIDI edges alike; the port namespace is per-kind, fixed by the
/// input that owns the connector.
#[derive(Debug)]
pub struct Connector {
    // 0 is unconnected, otherwise ((node << 16) | port) + 1
    cell: AtomicU64,
}

impl Connector {
    pub fn new() -> Self {
        Self {
            cell: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> Option<PortRef> {
        match self.cell.load(Ordering::Acquire) {
            0 => None,
            raw => {
                let raw = raw - 1;
                Some(PortRef {
                    node: NodeId((raw >> 16) as u32),
                    port: (raw & 0xffff) as u16,
                })
            }
        }
    }

    // script thread only, after cycle rejection
    pub(crate) fn publish(&self, source: PortRef) {
        let raw = ((source.node.0 as u64) << 16 | source.port as u64) + 1;
        self.cell.store(raw, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.cell.store(0, Ordering::Release);
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-cycle processing context handed to every node.
#[derive(Debug, Clone, Copy)]
pub struct ProcessScope {
    pub rolling: bool,
    /// Transport snapshot for this cycle; immutable once the callback starts.
    pub pos: Transport,
    pub nframes: u32,
    /// Monotonic frame time of this callback; strictly increases per cycle
    /// and drives the once-per-cycle dedup guard.
    pub time: u64,
}

/// Real-time services threaded through node processing: deferred deletion and
/// script-callback dispatch. Neither blocks or allocates.
pub struct Services<'a> {
    pub recycler: &'a mut Recycler,
    pub calls: &'a mut CallSender,
}

/// A node in the live graph. Implementations run on the process thread and
/// must not block or touch the allocator.
///
/// The once-per-cycle guard lives in the graph, not the node: `do_process`
/// runs at most once per callback no matter how many paths reach the node.
pub trait Processor: Send {
    /// Report the upstream ports this node will pull from this cycle. Called
    /// before `do_process`; the graph processes those sources first. Takes
    /// `&mut self` so a node can fold freshly queued connections into its
    /// working set here.
    fn dependencies(&mut self, _deps: &mut Vec<PortRef>) {}

    /// Execute one block. Inputs resolve through published connectors;
    /// unconnected audio inputs read a shared zero buffer.
    fn do_process(
        &mut self,
        scope: &ProcessScope,
        inputs: &Inputs<'_>,
        outputs: &mut PortBuffers,
        services: &mut Services<'_>,
    );

    /// A relocation is in progress: recycle queued state that no longer
    /// applies at the new position.
    fn reposition(&mut self, recycler: &mut Recycler);

    /// Polled after [`Processor::reposition`]; the transport stays parked
    /// until every node reports true.
    fn reposition_complete(&self) -> bool {
        true
    }
}

/// Errors from graph mutation, always raised on the script thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// The requested connection would make a node reachable from itself.
    CycleDetected,
    /// The engine was built with a fixed node capacity and it is full.
    TooManyNodes { limit: usize },
    /// The target node or input index is not registered.
    NoSuchInput { input: usize },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::CycleDetected => write!(f, "cannot connect infinite loop"),
            GraphError::TooManyNodes { limit } => write!(f, "graph is full ({limit} nodes)"),
            GraphError::NoSuchInput { input } => write!(f, "no such input {input}"),
        }
    }
}

impl std::error::Error for GraphError {}
