//! Retransmission engine for in-flight Reliable messages (§4.5).
//!
//! A [`PendingMessage`] owns the already-serialised [`Message`] it was built from (sequence id
//! and payload never change across retries) and just hands back the same bytes on every retry.
//! Following §9's design note, neither this type nor [`Connection`](crate::connection::Connection)
//! holds a back-pointer to the other: the values a retry decision needs (`smooth_rtt`,
//! `can_quality_disconnect`, the configured attempt ceiling) are passed in by the caller, which
//! is always the owning `Connection`.

use tidewire_collections::Message;
use tidewire_runtime::Tick;
use tidewire_utils::wire::DisconnectReason;

/// What happened when a send (first or retried) was attempted.
#[derive(Debug)]
pub enum TrySendOutcome {
	/// Bytes to hand to the transport, plus how long from now to schedule the next retry.
	Sent { bytes: Vec<u8>, retry_delay_ms: u64 },
	/// The attempt ceiling was reached with quality-disconnect enabled; the message is cleared.
	Disconnect(DisconnectReason),
}

/// What `retry_send` decided to do.
#[derive(Debug)]
pub enum RetryOutcome {
	/// Not enough time has passed since the last send; reschedule without resending.
	Rescheduled { delay_ms: u64 },
	/// Enough time passed (or never sent) — `try_send` ran, with this outcome.
	Attempted(TrySendOutcome),
	/// `clear` was already called; this retry is a stale no-op (§9 "Event scheduling").
	AlreadyCleared,
}

#[derive(Debug)]
pub struct PendingMessage {
	message: Message,
	last_send_time: Tick,
	send_attempts: u32,
	was_cleared: bool,
}

impl PendingMessage {
	/// Snapshot a fully-stamped Reliable `message` (seq id and payload already written).
	pub fn new(message: Message) -> Self {
		Self {
			message,
			last_send_time: Tick(0),
			send_attempts: 0,
			was_cleared: false,
		}
	}

	#[inline]
	pub fn send_attempts(&self) -> u32 {
		self.send_attempts
	}

	#[inline]
	pub fn was_cleared(&self) -> bool {
		self.was_cleared
	}

	/// The retry delay formula shared by `try_send` and `retry_send` (§4.5):
	/// 50ms with no RTT sample yet, otherwise `max(10, smooth_rtt * 1.2)`.
	fn retry_delay_ms(smooth_rtt: Option<f64>) -> u64 {
		match smooth_rtt {
			None => 50,
			Some(rtt) => (rtt * 1.2).max(10.0).round() as u64,
		}
	}

	/// Attempt (or re-attempt) delivery (§4.5 `try_send`).
	pub fn try_send(&mut self, now: Tick, smooth_rtt: Option<f64>, can_quality_disconnect: bool, max_send_attempts: u32) -> TrySendOutcome {
		if self.send_attempts >= max_send_attempts && can_quality_disconnect {
			self.was_cleared = true;
			return TrySendOutcome::Disconnect(DisconnectReason::PoorConnection);
		}

		self.send_attempts += 1;
		self.last_send_time = now;

		TrySendOutcome::Sent {
			bytes: self.message.as_bytes().to_vec(),
			retry_delay_ms: Self::retry_delay_ms(smooth_rtt),
		}
	}

	/// Decide whether a scheduled retry should actually resend or just reschedule (§4.5 `retry_send`).
	pub fn retry_send(&mut self, now: Tick, smooth_rtt: Option<f64>, can_quality_disconnect: bool, max_send_attempts: u32) -> RetryOutcome {
		if self.was_cleared {
			return RetryOutcome::AlreadyCleared;
		}

		let threshold = match smooth_rtt {
			Some(rtt) => (rtt / 2.0).max(25.0),
			None => 25.0,
		};

		let elapsed = now.0.saturating_sub(self.last_send_time.0) as f64;

		if elapsed > threshold {
			RetryOutcome::Attempted(self.try_send(now, smooth_rtt, can_quality_disconnect, max_send_attempts))
		} else {
			RetryOutcome::Rescheduled { delay_ms: Self::retry_delay_ms(smooth_rtt) }
		}
	}

	/// Mark cleared and hand back the buffer for the owning connection to release to its pool (§4.5).
	pub fn clear(mut self) -> Message {
		self.was_cleared = true;
		self.message
	}
}
