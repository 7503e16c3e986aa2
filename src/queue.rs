//! SPSC handoff primitives shared by every cross-thread bridge in the crate.
//!
//! Thin policy wrappers over [`rtrb`]: the script-thread side spins until a
//! bounded push is accepted (losing a scheduled musical event is worse than a
//! few microseconds of stall on a non-real-time thread), while process-thread
//! producers must use [`QueueWriter::try_send`] and never wait.

use rtrb::{Consumer, Producer, RingBuffer};

/// Create a bounded SPSC channel with `capacity` slots.
pub fn spsc<T>(capacity: usize) -> (QueueWriter<T>, QueueReader<T>) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (QueueWriter { producer }, QueueReader { consumer })
}

/// Producer half of a bounded SPSC channel.
pub struct QueueWriter<T> {
    producer: Producer<T>,
}

impl<T> QueueWriter<T> {
    /// Push, spinning until the queue accepts. Script thread only.
    pub fn send(&mut self, mut value: T) {
        loop {
            match self.producer.push(value) {
                Ok(()) => return,
                Err(rtrb::PushError::Full(rejected)) => {
                    value = rejected;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Push without waiting; returns the value back on a full queue.
    /// The only form a process-thread producer may use.
    pub fn try_send(&mut self, value: T) -> Result<(), T> {
        self.producer.push(value).map_err(|rtrb::PushError::Full(v)| v)
    }
}

/// Consumer half of a bounded SPSC channel.
pub struct QueueReader<T> {
    consumer: Consumer<T>,
}

impl<T> QueueReader<T> {
    pub fn try_recv(&mut self) -> Option<T> {
        self.consumer.pop().ok()
    }
}

/// A consumer-side working set fed by an SPSC queue.
///
/// The reading thread periodically drains freshly queued objects into a local
/// `Vec` it owns outright, then iterates or retains them across cycles. This
/// replaces the intrusive linked lists of classic RT engines with owned
/// storage; the backing `Vec` is pre-reserved to the queue capacity so drains
/// do not allocate in the steady state.
pub struct QueueList<T> {
    incoming: QueueReader<T>,
    items: Vec<T>,
}

impl<T> QueueList<T> {
    pub fn new(incoming: QueueReader<T>, capacity: usize) -> Self {
        Self {
            incoming,
            items: Vec::with_capacity(capacity),
        }
    }

    /// Move everything currently queued into the working set.
    pub fn drain_fresh(&mut self) {
        while let Some(item) = self.incoming.try_recv() {
            self.items.push(item);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn retain<F: FnMut(&T) -> bool>(&mut self, keep: F) {
        self.items.retain(keep);
    }

    /// Take ownership of the whole working set, leaving it empty.
    pub fn take_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    /// Empty both the working set and anything still queued.
    pub fn clear(&mut self) {
        while self.incoming.try_recv().is_some() {}
        self.items.clear();
    }
}
