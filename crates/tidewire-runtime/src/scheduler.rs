//! The Peer's min-heap of timed events (§3 `Scheduled Event`, §4.7).
//!
//! Priority is the absolute tick-time (ms since the owning `Clock` started) at
//! which an event becomes due. `Scheduler::drain_due` pops everything whose
//! priority is `<= now`, in priority order, so ties resolve oldest-scheduled
//! first via the insertion-order tiebreak baked into `ScheduledEvent`'s `Ord`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::clock::Tick;

/// What a due event asks the Peer to do (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
	HeartbeatTick,
	PendingMessageRetry { connection_id: u16, seq_id: u16 },
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct ScheduledEvent {
	priority: Tick,
	// Insertion order, used only to keep same-tick events in FIFO order.
	seq: u64,
	payload: EventPayload,
}

impl Ord for ScheduledEvent {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.priority.cmp(&other.priority).then_with(|| self.seq.cmp(&other.seq))
	}
}

impl PartialOrd for ScheduledEvent {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

#[derive(Debug, Default)]
pub struct Scheduler {
	heap: BinaryHeap<Reverse<ScheduledEvent>>,
	next_seq: u64,
}

impl Scheduler {
	pub fn new() -> Self {
		Self::default()
	}

	/// Push `payload` to fire at `now + delay_ms` (§4.7 `execute_later`).
	pub fn execute_later(&mut self, now: Tick, delay_ms: u64, payload: EventPayload) {
		let event = ScheduledEvent {
			priority: now.saturating_add(delay_ms),
			seq: self.next_seq,
			payload,
		};
		self.next_seq += 1;
		self.heap.push(Reverse(event));
	}

	/// Pop and return every event due at or before `now`, in priority order.
	pub fn drain_due(&mut self, now: Tick) -> Vec<EventPayload> {
		let mut due = Vec::new();

		while let Some(Reverse(event)) = self.heap.peek() {
			if event.priority > now {
				break;
			}

			let Reverse(event) = self.heap.pop().expect("just peeked");
			due.push(event.payload);
		}

		due
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.heap.len()
	}
}
