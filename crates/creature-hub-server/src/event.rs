//! The tagged event type scheduled onto the event loop, and its thread-safe
//! priority queue.
//!
//! Mirrors the source system's `Event` base class, but as a closed sum type
//! instead of a virtual-dispatch hierarchy: every firing is matched in
//! [`crate::eventloop::EventLoop::drain_due`] instead of calling an
//! overridden `execute()`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use creature_types::{CreatureId, DmxPayload, UniverseId};

use crate::session::PlaybackSession;
use crate::status_light::StatusLight;

pub type FrameNum = u64;

/// One scheduled occurrence: a target frame plus the work to do once it's due.
pub struct Event {
    pub target_frame: FrameNum,
    pub body: EventBody,
    seq: u64,
}

pub enum EventBody {
    DmxEmit {
        universe: UniverseId,
        channel_offset: u16,
        payload: DmxPayload,
    },
    PlaybackRunnerTick {
        session: Arc<PlaybackSession>,
    },
    StatusLight {
        light: StatusLight,
        on: bool,
    },
    CacheInvalidate {
        creature_id: Option<CreatureId>,
    },
    CounterSnapshot,
    /// Rotate to a fresh SSRC generation and prime receivers with silent
    /// frames. `first` is true only on the pulse that should actually
    /// rotate the SSRC and reset the encoders; subsequent self-rescheduled
    /// pulses (one per remaining silent frame, 5ms apart) carry `first:
    /// false` so the reset isn't repeated.
    EncoderResetAndPrime {
        remaining_silent_frames: u8,
        first: bool,
    },
    Tick,
    /// Generic escape hatch for one-off work that doesn't warrant its own
    /// variant. Runs with the same exception-isolation guarantees as any
    /// other event body.
    Defer(Box<dyn FnOnce(&crate::context::EventContext) + Send>),
}

impl Event {
    fn new(target_frame: FrameNum, body: EventBody, seq: u64) -> Self {
        Self { target_frame, body, seq }
    }
}

// BinaryHeap is a max-heap; we want the smallest target_frame first, with
// ties broken by insertion order (the `seq` counter), so wrap the ordering.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.target_frame == other.target_frame && self.seq == other.seq
    }
}
impl Eq for Event {}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .target_frame
            .cmp(&self.target_frame)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Multi-producer, single-consumer priority queue of events keyed by target
/// frame. Insertion may happen from any thread; extraction is the exclusive
/// business of the event loop thread.
pub struct EventQueue {
    heap: Mutex<BinaryHeap<Event>>,
    next_seq: AtomicU64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn schedule(&self, target_frame: FrameNum, body: EventBody) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.push(Event::new(target_frame, body, seq));
    }

    /// Pop the next event if its target frame has been reached, without
    /// holding the lock past this single check-and-pop.
    pub fn pop_due(&self, current_frame: FrameNum) -> Option<Event> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        match heap.peek() {
            Some(top) if top.target_frame <= current_frame => heap.pop(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_due_respects_frame_ordering() {
        let q = EventQueue::new();
        q.schedule(10, EventBody::Tick);
        q.schedule(5, EventBody::Tick);
        q.schedule(5, EventBody::CounterSnapshot);

        let first = q.pop_due(100).unwrap();
        assert_eq!(first.target_frame, 5);
        assert!(matches!(first.body, EventBody::Tick));

        let second = q.pop_due(100).unwrap();
        assert_eq!(second.target_frame, 5);
        assert!(matches!(second.body, EventBody::CounterSnapshot));

        let third = q.pop_due(100).unwrap();
        assert_eq!(third.target_frame, 10);
    }

    #[test]
    fn pop_due_holds_back_future_events() {
        let q = EventQueue::new();
        q.schedule(50, EventBody::Tick);
        assert!(q.pop_due(10).is_none());
        assert!(q.pop_due(50).is_some());
    }
}
