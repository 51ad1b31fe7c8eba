//! Monotonic simulation clock and deterministic event queue (C1).
//!
//! A plain min-heap, not a runtime task primitive, per the design notes:
//! "use an explicit min-heap; do not lean on runtime task primitives. The
//! loop is a plain function."

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::SimError;

/// Event kinds, ordered by fixed tiebreak priority.
/// Lower discriminant = higher priority at equal tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventKind {
    Arrival = 0,
    Admission = 1,
    Route = 2,
    Enqueue = 3,
    StepStart = 4,
    StepComplete = 5,
    TokenGenerated = 6,
    RequestFinished = 7,
    Preemption = 8,
    KvTransferComplete = 9,
    HorizonReached = 10,
}

/// A scheduled event. `instance_id`/`request_id` of `None` sort first
/// within their kind, which only matters for cluster-global events
/// (`Arrival`, `HorizonReached`) that have no owning instance/request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub tick: u64,
    pub kind: EventKind,
    pub instance_id: Option<u32>,
    pub request_id: Option<String>,
}

impl Event {
    pub fn new(tick: u64, kind: EventKind) -> Self {
        Self {
            tick,
            kind,
            instance_id: None,
            request_id: None,
        }
    }

    pub fn with_instance(mut self, instance_id: u32) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// `(tick, kind-priority, instance_id, request_id)` lexicographic
    /// tiebreak, fixed forever: determinism depends on it.
    fn sort_key(&self) -> (u64, u8, Option<u32>, &Option<String>) {
        (self.tick, self.kind as u8, self.instance_id, &self.request_id)
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest/ highest
        // priority event to pop first.
        other.sort_key().cmp(&self.sort_key())
    }
}

/// Monotonic clock plus priority-ordered event queue.
#[derive(Debug, Default)]
pub struct Clock {
    now_tick: u64,
    heap: BinaryHeap<Event>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            now_tick: 0,
            heap: BinaryHeap::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now_tick
    }

    /// Schedule an event. Fails with `ErrCausalityViolation` if `tick` is
    /// strictly in the past. Scheduling at `now_tick` itself is allowed
    /// (same-tick events, e.g. the scheduler's self-chained `StepStart`).
    pub fn schedule(&mut self, event: Event) -> Result<(), SimError> {
        if event.tick < self.now_tick {
            return Err(SimError::CausalityViolation {
                now: self.now_tick,
                attempted: event.tick,
            });
        }
        self.heap.push(event);
        Ok(())
    }

    pub fn peek_next_tick(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.tick)
    }

    /// Pop the next event and advance the clock to its tick. The clock may
    /// only jump forward: `now_tick` is non-decreasing across consecutive
    /// pops by construction of the heap ordering.
    pub fn advance(&mut self) -> Option<Event> {
        let event = self.heap.pop()?;
        debug_assert!(event.tick >= self.now_tick, "clock must not move backward");
        self.now_tick = event.tick;
        Some(event)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn horizon_reached(&self, horizon_us: u64) -> bool {
        self.now_tick >= horizon_us
    }
}
