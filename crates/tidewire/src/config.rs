//! Tunable knobs a host sets once per [`Peer`](crate::peer) and that propagate to every
//! connection it owns (§6 "Peer configuration").

/// Timing, retry, and quality-disconnect thresholds for a [`Client`](crate::client::Client) or
/// [`Server`](crate::server::Server). Values are plain fields rather than scattered module
/// constants so a host can override any of them before `start`, and a server can propagate a
/// changed `timeout_time` to every connection it currently holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerConfig {
	/// Idle time after which a connected peer is considered gone (§4.6).
	pub timeout_time_ms: u64,
	/// Idle time after which a still-connecting peer gives up (§4.6).
	pub connect_timeout_time_ms: u64,
	/// Interval between heartbeat ticks (§4.7, §6).
	pub heartbeat_interval_ms: u64,
	/// How many times a `Connect` is retried before `local_disconnect(NeverConnected)` (§4.8).
	pub max_connection_attempts: u32,
	/// Ceiling on reliable send attempts before a poor-connection disconnect is considered (§4.5).
	pub max_send_attempts: u32,
	/// Rolling mean of send attempts above which the quality-disconnect counter advances (§4.5, §4.6).
	pub max_avg_send_attempts: f64,
	/// Consecutive over-threshold ticks required to trip the send-attempts quality disconnect (§4.6).
	pub avg_send_attempts_resilience: u32,
	/// Rolling notify-loss rate above which the quality-disconnect counter advances (§4.6).
	pub max_notify_loss: f64,
	/// Consecutive over-threshold ticks required to trip the notify-loss quality disconnect (§4.6).
	pub notify_loss_resilience: u32,
	/// Bound on reusable buffers held per [`Pool`](tidewire_collections::Pool) (§4.2, §6).
	pub pool_size: usize,
	/// Max user payload in bytes, excluding the ≤5-byte header (§3, §6).
	pub max_payload_bytes: usize,
}

impl Default for PeerConfig {
	fn default() -> Self {
		Self {
			timeout_time_ms: 5000,
			connect_timeout_time_ms: 10_000,
			heartbeat_interval_ms: 1000,
			max_connection_attempts: 5,
			max_send_attempts: 15,
			max_avg_send_attempts: 5.0,
			avg_send_attempts_resilience: 64,
			max_notify_loss: 0.05,
			notify_loss_resilience: 64,
			pool_size: tidewire_collections::message::DEFAULT_POOL_SIZE,
			max_payload_bytes: tidewire_collections::message::DEFAULT_MAX_PAYLOAD_BYTES,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_the_documented_values() {
		let cfg = PeerConfig::default();
		assert_eq!(cfg.timeout_time_ms, 5000);
		assert_eq!(cfg.connect_timeout_time_ms, 10_000);
		assert_eq!(cfg.max_send_attempts, 15);
		assert_eq!(cfg.pool_size, 10);
		assert_eq!(cfg.max_payload_bytes, 1225);
	}
}
