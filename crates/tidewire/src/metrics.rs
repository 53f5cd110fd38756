//! Per-connection traffic counters (§3 `ConnectionMetrics`).
//!
//! Besides plain byte/message tallies split by delivery mode, this tracks a
//! 64-sample rolling delivered/lost window for Notify traffic and the
//! RollingStat of reliable send attempts the quality-disconnect check reads.

use tidewire_collections::RollingStat;

/// Width of the notify delivered/lost rolling window (§3, §6 `notify_loss_resilience`).
pub const NOTIFY_ROLLING_WINDOW: u32 = 64;

#[derive(Debug, Clone, Copy, Default)]
struct ModeCounters {
	bytes_in: u64,
	bytes_out: u64,
	count_in: u64,
	count_out: u64,
}

#[derive(Debug)]
pub struct ConnectionMetrics {
	unreliable: ModeCounters,
	notify: ModeCounters,
	reliable: ModeCounters,

	notify_discarded: u64,
	notify_delivered_total: u64,
	notify_lost_total: u64,
	/// Bit history of the last 64 notify verdicts, newest in bit 0: 1 = delivered, 0 = lost.
	notify_loss_tracker: u64,
	notify_window_filled: u32,
	rolling_notify_delivered: u32,
	rolling_notify_lost: u32,

	reliable_discarded: u64,
	reliable_uniques: u64,

	pub rolling_reliable_sends: RollingStat,
}

impl ConnectionMetrics {
	pub fn new() -> Self {
		Self {
			unreliable: ModeCounters::default(),
			notify: ModeCounters::default(),
			reliable: ModeCounters::default(),
			notify_discarded: 0,
			notify_delivered_total: 0,
			notify_lost_total: 0,
			notify_loss_tracker: 0,
			notify_window_filled: 0,
			rolling_notify_delivered: 0,
			rolling_notify_lost: 0,
			reliable_discarded: 0,
			reliable_uniques: 0,
			rolling_reliable_sends: RollingStat::new(NOTIFY_ROLLING_WINDOW as usize),
		}
	}

	/// Reset the traffic counters a new connection attempt starts fresh with. The rolling stats
	/// survive a reset, matching the upstream's `reset()` (which never touched them either).
	pub fn reset(&mut self) {
		self.unreliable = ModeCounters::default();
		self.notify = ModeCounters::default();
		self.reliable = ModeCounters::default();
		self.notify_discarded = 0;
		self.notify_delivered_total = 0;
		self.notify_lost_total = 0;
		self.reliable_discarded = 0;
		self.reliable_uniques = 0;
	}

	pub fn bytes_in(&self) -> u64 {
		self.unreliable.bytes_in + self.reliable.bytes_in + self.notify.bytes_in
	}

	pub fn bytes_out(&self) -> u64 {
		self.unreliable.bytes_out + self.reliable.bytes_out + self.notify.bytes_out
	}

	pub fn messages_in(&self) -> u64 {
		self.unreliable.count_in + self.reliable.count_in + self.notify.count_in
	}

	pub fn messages_out(&self) -> u64 {
		self.unreliable.count_out + self.reliable.count_out + self.notify.count_out
	}

	pub fn received_unreliable(&mut self, bytes: u64) {
		self.unreliable.bytes_in += bytes;
		self.unreliable.count_in += 1;
	}

	pub fn sent_unreliable(&mut self, bytes: u64) {
		self.unreliable.bytes_out += bytes;
		self.unreliable.count_out += 1;
	}

	pub fn received_notify(&mut self, bytes: u64) {
		self.notify.bytes_in += bytes;
		self.notify.count_in += 1;
	}

	pub fn sent_notify(&mut self, bytes: u64) {
		self.notify.bytes_out += bytes;
		self.notify.count_out += 1;
	}

	pub fn received_reliable(&mut self, bytes: u64) {
		self.reliable.bytes_in += bytes;
		self.reliable.count_in += 1;
	}

	pub fn sent_reliable(&mut self, bytes: u64) {
		self.reliable.bytes_out += bytes;
		self.reliable.count_out += 1;
	}

	pub fn increment_reliable_uniques(&mut self) {
		self.reliable_uniques += 1;
	}

	pub fn increment_notify_discarded(&mut self) {
		self.notify_discarded += 1;
	}

	pub fn increment_reliable_discarded(&mut self) {
		self.reliable_discarded += 1;
	}

	pub fn reliable_discarded(&self) -> u64 {
		self.reliable_discarded
	}

	pub fn notify_discarded(&self) -> u64 {
		self.notify_discarded
	}

	/// Record one Notify delivery verdict into the rolling window, evicting the oldest sample
	/// once it's full and keeping `rolling_notify_delivered + rolling_notify_lost` at the window size.
	pub fn record_notify_verdict(&mut self, delivered: bool) {
		if delivered {
			self.notify_delivered_total += 1;
		} else {
			self.notify_lost_total += 1;
		}

		if self.notify_window_filled < NOTIFY_ROLLING_WINDOW {
			self.notify_window_filled += 1;
		} else {
			let evicted_delivered = self.notify_loss_tracker & (1 << (NOTIFY_ROLLING_WINDOW - 1)) != 0;

			if evicted_delivered {
				self.rolling_notify_delivered -= 1;
			} else {
				self.rolling_notify_lost -= 1;
			}
		}

		if delivered {
			self.rolling_notify_delivered += 1;
		} else {
			self.rolling_notify_lost += 1;
		}

		self.notify_loss_tracker <<= 1;

		if delivered {
			self.notify_loss_tracker |= 1;
		}
	}

	/// Fraction of the rolling window's samples that were lost, `0.0` until the window has any samples.
	pub fn rolling_notify_loss_rate(&self) -> f64 {
		if self.notify_window_filled == 0 {
			return 0.0;
		}

		self.rolling_notify_lost as f64 / NOTIFY_ROLLING_WINDOW as f64
	}
}

impl Default for ConnectionMetrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rolling_loss_rate_tracks_recent_window_only() {
		let mut m = ConnectionMetrics::new();

		for _ in 0..64 {
			m.record_notify_verdict(true);
		}
		assert_eq!(m.rolling_notify_loss_rate(), 0.0);

		for _ in 0..32 {
			m.record_notify_verdict(false);
		}
		// 32 of the most recent 64 samples are now losses.
		assert!((m.rolling_notify_loss_rate() - 0.5).abs() < 1e-9);

		for _ in 0..32 {
			m.record_notify_verdict(true);
		}
		// The 32 losses have aged out of the 64-sample window.
		assert_eq!(m.rolling_notify_loss_rate(), 0.0);
	}

	#[test]
	fn byte_and_message_totals_sum_across_modes() {
		let mut m = ConnectionMetrics::new();
		m.sent_unreliable(10);
		m.sent_notify(20);
		m.sent_reliable(30);
		assert_eq!(m.bytes_out(), 60);
		assert_eq!(m.messages_out(), 3);
	}
}
