//! The reliability core: cumulative + selective ack tracking for Reliable
//! traffic, and single-shot delivery verdicts for Notify traffic (§4.4).
//!
//! Both specializations share the same base state (§4.4) but diverge in
//! `should_handle`/`update_received_acks`. Rather than reaching back into the
//! owning `Connection` the way the original callback-based design does,
//! these methods return the side effects the caller (the `Connection`) must
//! apply — resends, pending-message clears, notify verdicts — so the
//! sequencer itself never needs a back-reference.

use log::warn;
use tidewire_collections::Bitfield;
use tidewire_utils::seq::{gap, next_wrapping};

/// What the connection must do in response to an incoming selective ack (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
	/// The sequence id was never acknowledged within the ack window; resend it.
	Resend(u16),
	/// The sequence id has now been acknowledged; drop its pending entry.
	Clear(u16),
}

/// The fate of one Notify-mode send, reported once and only once (§4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyVerdict {
	Delivered(u16),
	Lost(u16),
}

#[derive(Debug, Clone, Default)]
struct SequencerBase {
	next_sequence_id: u16,
	last_received_seq_id: u16,
	received_seq_ids: Bitfield,
	last_acked_seq_id: u16,
	acked_seq_ids: Bitfield,
}

impl SequencerBase {
	fn new() -> Self {
		Self {
			next_sequence_id: 1,
			..Default::default()
		}
	}

	fn take_next_sequence_id(&mut self) -> u16 {
		let id = self.next_sequence_id;
		self.next_sequence_id = next_wrapping(self.next_sequence_id);
		id
	}
}

#[derive(Debug, Clone, Default)]
pub struct ReliableSequencer {
	base: SequencerBase,
}

impl ReliableSequencer {
	pub fn new() -> Self {
		Self { base: SequencerBase::new() }
	}

	pub fn next_sequence_id(&mut self) -> u16 {
		self.base.take_next_sequence_id()
	}

	pub fn last_received_seq_id(&self) -> u16 {
		self.base.last_received_seq_id
	}

	pub fn received_seq_ids_first_16(&self) -> u16 {
		self.base.received_seq_ids.first_16()
	}

	/// Whether `seq` is a fresh arrival worth handing to the user (§4.4.1). A selective ack is
	/// owed to the sender regardless of the outcome; the caller (`Connection`) sends it.
	pub fn should_handle(&mut self, seq: u16) -> bool {
		let mut sequence_gap = gap(seq, self.base.last_received_seq_id);

		if sequence_gap == 0 {
			return false;
		}

		if sequence_gap > 0 {
			if sequence_gap > 64 {
				warn!("gap between received reliable sequence ids was unusually large ({sequence_gap})");
			}

			self.base.received_seq_ids.shift_left(sequence_gap as u32);
			self.base.last_received_seq_id = seq;
		} else {
			sequence_gap = -sequence_gap;
		}

		let pos = sequence_gap as u32;
		let already_seen = self.base.received_seq_ids.test(pos);
		self.base.received_seq_ids.set(pos);

		!already_seen
	}

	/// Fold a selective ack from the remote peer into our acked-id window (§4.4.1).
	pub fn update_received_acks(&mut self, remote_last_received: u16, remote_received_bits: u32) -> Vec<AckAction> {
		let mut actions = Vec::new();
		let sequence_gap = gap(remote_last_received, self.base.last_acked_seq_id);

		if sequence_gap > 0 {
			let gap_u = sequence_gap as u32;
			let (fits, overflow) = self.base.acked_seq_ids.has_capacity_for(gap_u);

			if !fits {
				for _ in 0..overflow {
					let (was_set, trimmed_pos) = self.base.acked_seq_ids.trim_trailing_set_bit();
					let trimmed_seq = self.base.last_acked_seq_id.wrapping_sub(trimmed_pos as u16);

					if was_set {
						actions.push(AckAction::Clear(trimmed_seq));
					} else {
						actions.push(AckAction::Resend(trimmed_seq));
					}
				}
			}

			self.base.acked_seq_ids.shift_left(gap_u);
			self.base.last_acked_seq_id = remote_last_received;

			for i in 0..16u32 {
				let locally_set = self.base.acked_seq_ids.test(i + 1);
				let remote_set = remote_received_bits & (1 << i) != 0;

				if !locally_set && remote_set {
					let acked_seq = self.base.last_acked_seq_id.wrapping_sub(i as u16 + 1);
					actions.push(AckAction::Clear(acked_seq));
				}
			}

			self.base.acked_seq_ids.combine(remote_received_bits);
			self.base.acked_seq_ids.set(gap_u);
			actions.push(AckAction::Clear(remote_last_received));
		} else if sequence_gap < 0 {
			self.base.acked_seq_ids.set((-sequence_gap) as u32);
		} else {
			self.base.acked_seq_ids.combine(remote_received_bits);
		}

		actions
	}
}

#[derive(Debug, Clone, Default)]
pub struct NotifySequencer {
	base: SequencerBase,
}

impl NotifySequencer {
	pub fn new() -> Self {
		Self { base: SequencerBase::new() }
	}

	pub fn last_received_seq_id(&self) -> u16 {
		self.base.last_received_seq_id
	}

	pub fn received_seq_ids_first_8(&self) -> u8 {
		self.base.received_seq_ids.first_8()
	}

	/// Allocate the next sequence id and return the 40-bit notify field to stamp into the header
	/// (§4.4.2 `insert_header`): `last_received ‖ received_bitfield.first_8 ‖ this_seq`.
	pub fn insert_header(&mut self) -> (u16, u64) {
		let seq = self.base.take_next_sequence_id();
		let packed = (self.base.last_received_seq_id as u64)
			| ((self.base.received_seq_ids.first_8() as u64) << 16)
			| ((seq as u64) << 24);
		(seq, packed)
	}

	/// Single-shot delivery decision: a stale or duplicate id is dropped outright, never re-delivered (§4.4.2).
	pub fn should_handle(&mut self, seq: u16) -> bool {
		let sequence_gap = gap(seq, self.base.last_received_seq_id);

		if sequence_gap <= 0 {
			return false;
		}

		self.base.received_seq_ids.shift_left(sequence_gap as u32);
		self.base.last_received_seq_id = seq;

		let pos = sequence_gap as u32;

		if self.base.received_seq_ids.test(pos) {
			return false;
		}

		self.base.received_seq_ids.set(pos);
		true
	}

	/// Turn the remote's echoed notify field into delivery verdicts for everything sent since the
	/// last one we heard about (§4.4.2). A gap wider than 9 ids is declared Lost without consulting
	/// the 8-bit window, since the remote's bitfield cannot possibly cover it.
	pub fn update_received_acks(&mut self, remote_last_received: u16, remote_received_bits: u8) -> Vec<NotifyVerdict> {
		let mut verdicts = Vec::new();
		let mut sequence_gap = gap(remote_last_received, self.base.last_acked_seq_id);

		if sequence_gap > 0 {
			if sequence_gap > 1 {
				while sequence_gap > 9 {
					self.base.last_acked_seq_id = self.base.last_acked_seq_id.wrapping_add(1);
					sequence_gap -= 1;
					verdicts.push(NotifyVerdict::Lost(self.base.last_acked_seq_id));
				}

				let bit_count = (sequence_gap - 1) as u32;
				// bit_count can be 8 (a gap of exactly 9), one past what a u8 shift can hold, so
				// the running mask is tracked in a u16 and narrowed back down on use.
				let mut bit: u16 = 1u16 << bit_count;

				for _ in 0..bit_count {
					self.base.last_acked_seq_id = self.base.last_acked_seq_id.wrapping_add(1);
					bit >>= 1;

					if remote_received_bits & bit as u8 == 0 {
						verdicts.push(NotifyVerdict::Lost(self.base.last_acked_seq_id));
					} else {
						verdicts.push(NotifyVerdict::Delivered(self.base.last_acked_seq_id));
					}
				}
			}

			self.base.last_acked_seq_id = remote_last_received;
			verdicts.push(NotifyVerdict::Delivered(self.base.last_acked_seq_id));
		}

		verdicts
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duplicate_and_old_reliable_ids_are_not_handled_twice() {
		let mut seq = ReliableSequencer::new();
		assert!(seq.should_handle(1));
		assert!(!seq.should_handle(1), "duplicate of last_received must not be handled");

		assert!(seq.should_handle(2));
		assert!(seq.should_handle(3));
		// id 2 arrives again, now "older" relative to last_received (3).
		assert!(!seq.should_handle(2));
	}

	#[test]
	fn fresh_gap_is_handled_exactly_once() {
		let mut seq = ReliableSequencer::new();
		assert!(seq.should_handle(5));
		assert!(!seq.should_handle(5));
	}

	#[test]
	fn reliable_ack_round_trip_drains_pending_map() {
		let mut sender = ReliableSequencer::new();
		let mut receiver = ReliableSequencer::new();

		let mut cleared = Vec::new();

		for _ in 0..100 {
			let seq = sender.next_sequence_id();
			assert!(receiver.should_handle(seq));

			let actions = sender.update_received_acks(receiver.last_received_seq_id(), receiver.received_seq_ids_first_16() as u32);

			for action in actions {
				if let AckAction::Clear(s) = action {
					cleared.push(s);
				}
			}
		}

		assert_eq!(cleared.len(), 100);
	}

	#[test]
	fn notify_ack_gap_of_exactly_nine_does_not_overflow_the_bit_shift() {
		let mut sender = NotifySequencer::new();

		// last_acked_seq_id starts at 0, so a remote_last_received of 9 is a gap of exactly 9 —
		// the one-past-the-while-loop edge case the bit mask has to cover without overflowing.
		let verdicts = sender.update_received_acks(9, 0b1111_1111);

		assert_eq!(verdicts.len(), 9);
		assert!(verdicts.iter().all(|v| matches!(v, NotifyVerdict::Delivered(_))));
	}

	#[test]
	fn notify_each_send_resolves_to_exactly_one_verdict() {
		let mut sender = NotifySequencer::new();
		let mut receiver = NotifySequencer::new();
		let mut verdicts = Vec::new();

		for i in 0..20 {
			let (seq, _packed) = sender.insert_header();
			// Every third notify datagram is dropped in flight.
			if i % 3 != 0 {
				receiver.should_handle(seq);
			}

			// The receiver's own state, as it would be echoed back on its next outgoing notify header.
			verdicts.extend(sender.update_received_acks(receiver.last_received_seq_id(), receiver.received_seq_ids_first_8()));
		}

		assert_eq!(verdicts.len(), 20);
	}
}
