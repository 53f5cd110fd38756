//! A bounded pool of reusable [`Message`] buffers (§4.2), avoiding a fresh
//! allocation on every send/receive.

use tidewire_utils::wire::HeaderKind;

use super::message::{Message, DEFAULT_MAX_PAYLOAD_BYTES, MAX_HEADER_BYTES};

/// Default number of buffers a single pool holds onto (§6 Peer configuration).
pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Debug)]
pub struct Pool {
	capacity: usize,
	max_payload_bytes: usize,
	free: Vec<Message>,
}

impl Pool {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
			free: Vec::with_capacity(capacity),
		}
	}

	/// The payload capacity new buffers are built with.
	#[inline]
	pub fn max_payload_bytes(&self) -> usize {
		self.max_payload_bytes
	}

	/// Change the payload cap for buffers built from now on. The caller (the Peer) is
	/// responsible for refusing this while any client/server is active (§4.2) — this
	/// pool only stores the value and applies it to future `new Message` allocations.
	pub fn set_max_payload_bytes(&mut self, bytes: usize) {
		self.max_payload_bytes = bytes;
	}

	/// Take a cleared message stamped with `kind`, reusing a freed buffer when one is available.
	pub fn acquire(&mut self, kind: HeaderKind) -> Message {
		match self.free.pop() {
			Some(mut msg) => {
				msg.reset(kind);
				msg
			}
			None => Message::new(kind, self.max_payload_bytes),
		}
	}

	/// Return a message to the pool. Dropped silently once the pool is at capacity.
	pub fn release(&mut self, msg: Message) {
		if self.free.len() < self.capacity {
			self.free.push(msg);
		}
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.free.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.free.is_empty()
	}
}

impl Default for Pool {
	fn default() -> Self {
		Self::new(DEFAULT_POOL_SIZE)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_returns_a_cleared_message() {
		let mut pool = Pool::default();
		let msg = pool.acquire(HeaderKind::Unreliable);
		assert_eq!(msg.kind(), HeaderKind::Unreliable);
		assert_eq!(msg.buf().read_bit(), 0);
	}

	#[test]
	fn released_buffers_are_reused() {
		let mut pool = Pool::new(2);
		let msg = pool.acquire(HeaderKind::Heartbeat);
		pool.release(msg);
		assert_eq!(pool.len(), 1);

		let reused = pool.acquire(HeaderKind::Ack);
		assert_eq!(pool.len(), 0);
		assert_eq!(reused.kind(), HeaderKind::Ack);
	}

	#[test]
	fn release_past_capacity_drops_the_message() {
		let mut pool = Pool::new(1);
		pool.release(pool.acquire(HeaderKind::Heartbeat));
		pool.release(Message::new(HeaderKind::Heartbeat, 16));
		assert_eq!(pool.len(), 1);
	}

	/// §8 testable property 6: shrinking the max payload changes the size newly acquired
	/// messages are built with.
	#[test]
	fn shrinking_max_payload_caps_newly_acquired_messages() {
		let mut pool = Pool::new(1);
		pool.set_max_payload_bytes(8);

		let msg = pool.acquire(HeaderKind::Unreliable);
		assert_eq!(msg.buf().capacity_bytes(), 8 + MAX_HEADER_BYTES);
	}
}
