//! Processor survivorship across script runs.
//!
//! Rerunning a script must not tear the live graph down: a node that the new
//! run asks for again is the same node, kept running, glitch-free. Identity
//! is structural, not nominal: a shape hash (whatever configuration makes two
//! nodes interchangeable) plus the ordinal of creation within the run. The
//! second identically-shaped node a run creates is a distinct instance; a run
//! that creates them in a different order gets different nodes back, which is
//! the price of not having names.
//!
//! Handles that a run does not re-request are swept when the run completes
//! and their live nodes are scheduled for removal.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::graph::NodeId;

/// Cache identity of one node: shape hash plus creation ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub shape: u64,
    pub ordinal: u32,
}

/// A script-side handle that can survive in a cache.
pub trait CachedHandle {
    /// A new run re-acquired this handle: reset script-visible state (event
    /// dedup maps and the like). The live node keeps playing untouched.
    fn restore(&mut self);

    /// The live node this handle fronts, for removal on sweep.
    fn node(&self) -> NodeId;
}

/// Erased view over all caches, for the end-of-run sweep.
pub trait ObjectCache {
    /// The run finished: drop unreferenced handles, reset ordinal counters,
    /// and report the node ids whose live entries must be removed.
    fn script_complete(&mut self, removed: &mut Vec<NodeId>);
}

/// One cache of handles sharing a handle type.
pub struct ProcessorCache<H: CachedHandle> {
    entries: HashMap<CacheKey, CachedEntry<H>>,
    // per-shape creation counters, reset each run
    ordinals: HashMap<u64, u32>,
}

struct CachedEntry<H> {
    handle: H,
    referenced: bool,
}

impl<H: CachedHandle> ProcessorCache<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ordinals: HashMap::new(),
        }
    }

    /// Fetch the next node of this shape for the current run, building it if
    /// the previous run did not leave one behind.
    ///
    /// The ordinal is consumed either way, so creation order alone determines
    /// which cached instance a request maps to.
    pub fn acquire<E>(
        &mut self,
        shape: u64,
        build: impl FnOnce() -> Result<H, E>,
    ) -> Result<&mut H, E> {
        let counter = self.ordinals.entry(shape).or_insert(0);
        let key = CacheKey {
            shape,
            ordinal: *counter,
        };
        *counter += 1;
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.referenced = true;
                entry.handle.restore();
                Ok(&mut entry.handle)
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(CachedEntry {
                    handle: build()?,
                    referenced: true,
                });
                Ok(&mut entry.handle)
            }
        }
    }

    /// Find a cached handle by the node it fronts. Caches stay small (a few
    /// dozen nodes at most), so this is a scan.
    pub fn get_by_node(&mut self, node: NodeId) -> Option<&mut H> {
        self.entries
            .values_mut()
            .find(|entry| entry.handle.node() == node)
            .map(|entry| &mut entry.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: CachedHandle> Default for ProcessorCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: CachedHandle> ObjectCache for ProcessorCache<H> {
    fn script_complete(&mut self, removed: &mut Vec<NodeId>) {
        self.entries.retain(|_, entry| {
            if entry.referenced {
                entry.referenced = false;
                true
            } else {
                removed.push(entry.handle.node());
                false
            }
        });
        self.ordinals.clear();
    }
}
