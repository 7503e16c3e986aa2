use crate::collect::Recycler;
use crate::queue::{spsc, QueueReader, QueueWriter};
use crate::transport::Transport;

use super::ScheduledEvent;

/// Tuning knobs for one event buffer.
///
/// The defaults are the empirical values the original engine shipped with;
/// they are tied to a 44.1–48k / 64–1024-frame regime, which is why they are
/// configuration and not constants.
#[derive(Debug, Clone, Copy)]
pub struct EventBufferConfig {
    /// Queue capacity in events.
    pub capacity: usize,
    /// Events older than this many frames at delivery time are dropped.
    pub late_window: i64,
    /// Max freshly queued events folded into the sorted list per cycle.
    pub drain_batch: usize,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 2048,
            late_window: 256,
            drain_batch: 32,
        }
    }
}

/// Create the two halves of an event buffer.
///
/// The [`EventWriter`] belongs to the script thread, the [`EventQueue`] to
/// the process thread.
pub fn event_buffer<T: ScheduledEvent>(
    config: EventBufferConfig,
) -> (EventWriter<T>, EventQueue<T>) {
    let (tx, rx) = spsc(config.capacity);
    (
        EventWriter { queue: tx },
        EventQueue {
            incoming: rx,
            sorted: Vec::with_capacity(config.capacity),
            config,
        },
    )
}

/// Script-thread half: pushes scheduled events toward the process thread.
pub struct EventWriter<T: ScheduledEvent> {
    queue: QueueWriter<Box<T>>,
}

impl<T: ScheduledEvent> EventWriter<T> {
    /// Queue an event. Spins until the queue accepts; a scheduled musical
    /// event is never dropped on the floor.
    pub fn schedule(&mut self, event: T) {
        self.queue.send(Box::new(event));
    }
}

/// An event that is due within the current cycle.
pub struct Due<T> {
    /// Frame offset into the block; negative within the grace window.
    pub offset: i64,
    pub event: Box<T>,
}

/// Process-thread half: delivers events in position order, frame-exact.
pub struct EventQueue<T: ScheduledEvent> {
    incoming: QueueReader<Box<T>>,
    // non-decreasing by position; index 0 is the most imminent
    sorted: Vec<Box<T>>,
    config: EventBufferConfig,
}

impl<T: ScheduledEvent> EventQueue<T> {
    /// Fold up to one batch of freshly queued events into the sorted list.
    ///
    /// Insertion is append-biased: arrivals are mostly in time order already,
    /// so the common case is a push onto the tail.
    fn drain(&mut self) {
        let mut count = 0;
        while count < self.config.drain_batch {
            let Some(event) = self.incoming.try_recv() else {
                break;
            };
            let pos = event.position();
            if self.sorted.last().map_or(true, |tail| tail.position() <= pos) {
                self.sorted.push(event);
            } else {
                let at = self.sorted.partition_point(|e| e.position() <= pos);
                self.sorted.insert(at, event);
            }
            count += 1;
        }
    }

    /// Return the single most imminent event due within this block, if any.
    ///
    /// The caller loops until `None`. Events more than the grace window past
    /// due are recycled without delivery; that is routine (clock drift,
    /// batched cache flushes), not an error. Nothing is ever delivered while
    /// the transport is not rolling.
    pub fn next_event(
        &mut self,
        rolling: bool,
        pos: &Transport,
        nframes: u32,
        recycler: &mut Recycler,
    ) -> Option<Due<T>> {
        self.drain();
        if !rolling {
            return None;
        }
        while !self.sorted.is_empty() {
            let offset = self.sorted[0].position().frame_offset(pos);
            if offset < -self.config.late_window {
                // missed it; recycle, never deliver
                let late = self.sorted.remove(0);
                recycler.recycle(late);
                continue;
            }
            if offset < i64::from(nframes) {
                return Some(Due {
                    offset,
                    event: self.sorted.remove(0),
                });
            }
            break; // earliest event is beyond this block
        }
        None
    }

    /// Drain everything (queued and sorted) into deferred deletion.
    /// Reposition path: returns the buffer to empty.
    pub fn recycle_remaining(&mut self, recycler: &mut Recycler) {
        while let Some(event) = self.incoming.try_recv() {
            recycler.recycle(event);
        }
        recycler.recycle_all(
            self.sorted
                .drain(..)
                .map(|event| event as Box<dyn Send>),
        );
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.sorted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::collector;
    use crate::time::Position;

    struct TestEvent {
        at: Position,
        tag: u32,
    }

    impl ScheduledEvent for TestEvent {
        fn position(&self) -> Position {
            self.at
        }
    }

    fn ev(bar: u32, units: u32, division: u32, tag: u32) -> TestEvent {
        TestEvent {
            at: Position::new(bar, units, division).unwrap(),
            tag,
        }
    }

    fn transport_at_bar(bar: u32) -> Transport {
        Transport {
            bar,
            bbt_valid: true,
            ..Transport::default()
        }
    }

    #[test]
    fn test_delivery_in_position_order() {
        let (mut writer, mut queue) = event_buffer(EventBufferConfig::default());
        let (mut recycler, _reclaimer) = collector(16);
        // insert out of order
        writer.schedule(ev(1, 2, 4, 2));
        writer.schedule(ev(1, 0, 4, 0));
        writer.schedule(ev(2, 0, 4, 3));
        writer.schedule(ev(1, 1, 4, 1));

        let pos = transport_at_bar(1);
        let mut tags = Vec::new();
        // big enough block that everything in bar 1 and 2 is due
        while let Some(due) = queue.next_event(true, &pos, 200_000, &mut recycler) {
            tags.push(due.event.tag);
        }
        assert_eq!(tags, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_nothing_delivered_while_stopped() {
        let (mut writer, mut queue) = event_buffer(EventBufferConfig::default());
        let (mut recycler, _reclaimer) = collector(16);
        writer.schedule(ev(1, 0, 1, 0));
        let pos = transport_at_bar(1);
        assert!(queue.next_event(false, &pos, 512, &mut recycler).is_none());
        // still queued for when the transport rolls
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_event_beyond_block_stays_queued() {
        let (mut writer, mut queue) = event_buffer(EventBufferConfig::default());
        let (mut recycler, _reclaimer) = collector(16);
        writer.schedule(ev(2, 0, 1, 0)); // one bar = 96000 frames away
        let pos = transport_at_bar(1);
        assert!(queue.next_event(true, &pos, 512, &mut recycler).is_none());
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_late_event_dropped_and_recycled_once() {
        let (mut writer, mut queue) = event_buffer(EventBufferConfig::default());
        let (mut recycler, mut reclaimer) = collector(16);
        writer.schedule(ev(1, 0, 1, 0)); // a full bar in the past
        let pos = transport_at_bar(2);
        assert!(queue.next_event(true, &pos, 512, &mut recycler).is_none());
        assert_eq!(queue.pending(), 0);
        assert_eq!(reclaimer.free(), 1);
        // and only once
        assert!(queue.next_event(true, &pos, 512, &mut recycler).is_none());
        assert_eq!(reclaimer.free(), 0);
    }

    #[test]
    fn test_grace_window_still_delivers_slightly_late() {
        let config = EventBufferConfig::default();
        let (mut writer, mut queue) = event_buffer(config);
        let (mut recycler, _reclaimer) = collector(16);
        writer.schedule(ev(1, 0, 1, 0));
        // transport 16 ticks into bar 1: offset is -200 frames, inside the window
        let pos = Transport {
            bar: 1,
            tick: 16,
            bbt_valid: true,
            ..Transport::default()
        };
        let due = queue.next_event(true, &pos, 512, &mut recycler).unwrap();
        assert!(due.offset < 0);
        assert!(due.offset >= -config.late_window);
    }

    #[test]
    fn test_drain_batch_is_bounded_per_call() {
        let config = EventBufferConfig {
            drain_batch: 4,
            ..EventBufferConfig::default()
        };
        let (mut writer, mut queue) = event_buffer(config);
        let (mut recycler, _reclaimer) = collector(16);
        for n in 0..10 {
            writer.schedule(ev(10, n, 32, n));
        }
        let pos = transport_at_bar(1);
        // far-future events: nothing delivered, one batch folded in
        assert!(queue.next_event(true, &pos, 512, &mut recycler).is_none());
        assert_eq!(queue.pending(), 4);
        assert!(queue.next_event(true, &pos, 512, &mut recycler).is_none());
        assert_eq!(queue.pending(), 8);
    }

    #[test]
    fn test_recycle_remaining_empties_everything() {
        let (mut writer, mut queue) = event_buffer(EventBufferConfig::default());
        let (mut recycler, mut reclaimer) = collector(16);
        writer.schedule(ev(1, 0, 4, 0));
        writer.schedule(ev(1, 1, 4, 1));
        let pos = transport_at_bar(1);
        // fold one into the sorted list, leave one queued
        let _ = queue.next_event(false, &pos, 512, &mut recycler);
        writer.schedule(ev(1, 2, 4, 2));
        queue.recycle_remaining(&mut recycler);
        assert_eq!(queue.pending(), 0);
        assert_eq!(reclaimer.free(), 3);
    }
}
