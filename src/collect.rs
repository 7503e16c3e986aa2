//! Deferred cross-thread destruction.
//!
//! An object is never freed by the thread that decided it was dead: the
//! process thread pushes retired objects through a bounded queue and the
//! owning thread drops them at its leisure. On a full queue the process side
//! falls back to a local waiting list rather than ever blocking; the waiting
//! list is flushed opportunistically on later cycles.

use crate::queue::{spsc, QueueReader, QueueWriter};

/// Anything the collector can carry. Dropping the box is the destruction.
pub type Collectable = Box<dyn Send>;

/// Create a collector pair with `capacity` queue slots.
///
/// The [`Recycler`] lives on the thread that retires objects, the
/// [`Reclaimer`] on the thread that owns (and may free) them. The two
/// directions an engine needs are two independent instances; their
/// directionality must never be reversed.
pub fn collector(capacity: usize) -> (Recycler, Reclaimer) {
    let (tx, rx) = spsc(capacity);
    (
        Recycler {
            queue: tx,
            waiting: Vec::with_capacity(capacity),
        },
        Reclaimer { queue: rx },
    )
}

/// Retiring side. Lock-free, never blocks, never frees.
pub struct Recycler {
    queue: QueueWriter<Collectable>,
    waiting: Vec<Collectable>,
}

impl Recycler {
    /// Hand one dead object to the owning thread.
    pub fn recycle(&mut self, object: Collectable) {
        if let Err(rejected) = self.queue.try_send(object) {
            self.waiting.push(rejected);
        }
    }

    /// Hand over a whole batch (reposition flushes).
    pub fn recycle_all<I: IntoIterator<Item = Collectable>>(&mut self, objects: I) {
        self.waiting.extend(objects);
        self.flush();
    }

    /// Move waiting objects into the queue while it has room.
    /// Called once per cycle so an earlier overflow drains out.
    pub fn flush(&mut self) {
        while let Some(object) = self.waiting.pop() {
            if let Err(rejected) = self.queue.try_send(object) {
                self.waiting.push(rejected);
                return;
            }
        }
    }

    #[cfg(test)]
    fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}

/// Owning side. Drops everything the recycler has queued.
pub struct Reclaimer {
    queue: QueueReader<Collectable>,
}

impl Reclaimer {
    /// Drop all objects currently queued; returns how many were freed.
    pub fn free(&mut self) -> usize {
        let mut freed = 0;
        while self.queue.try_recv().is_some() {
            freed += 1;
        }
        freed
    }
}
