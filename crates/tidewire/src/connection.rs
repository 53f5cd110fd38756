//! Per-peer connection state machine: lifecycle, RTT/heartbeat, the two sequencers, the pending
//! map, and the frame builders that go with all of it (§3 `Connection`, §4.6).
//!
//! Following the back-pointer design note in §9, nothing here holds a reference back to its
//! owning `Peer`/`Client`/`Server`: every method that needs the pool or the current tick takes it
//! as a parameter, and every method that would otherwise need to reach into the transport or the
//! scheduler instead returns the bytes (and retry delay) for the caller to act on.

use std::collections::HashMap;

use log::warn;
use tidewire_collections::message::BitBuffer;
use tidewire_collections::{Message, Pool};
use tidewire_runtime::Tick;
use tidewire_transport::Endpoint;
use tidewire_utils::error::{CodecResult, ProtoResult};
use tidewire_utils::wire::{ConnectionState, DisconnectReason, HeaderKind};

use crate::metrics::ConnectionMetrics;
use crate::pending::{PendingMessage, RetryOutcome, TrySendOutcome};
use crate::sequencer::{AckAction, NotifySequencer, NotifyVerdict, ReliableSequencer};

/// What the caller must do after folding a selective ack into the reliable sequencer (§4.4.1).
#[derive(Debug, Default)]
pub struct AckEffects {
	/// `(seq_id, bytes, retry_delay_ms)` for each pending message that needs resending now.
	pub resends: Vec<(u16, Vec<u8>, u64)>,
	/// Set when the reliable send-attempts ceiling was crossed for a resent message.
	pub disconnect: Option<DisconnectReason>,
}

/// What a due `PendingMessageRetry` event should do (§4.5, §9 "a stale retry is a no-op").
#[derive(Debug)]
pub enum PendingRetryEffect {
	Resend { bytes: Vec<u8>, retry_delay_ms: u64 },
	Reschedule { delay_ms: u64 },
	Disconnect(DisconnectReason),
}

/// Outcome of running an incoming Notify frame through the notify sequencer (§4.4.2).
#[derive(Debug)]
pub struct NotifyOutcome {
	pub should_deliver: bool,
	pub verdicts: Vec<NotifyVerdict>,
}

pub struct Connection {
	id: u16,
	endpoint: Endpoint,
	state: ConnectionState,

	rtt: Option<u64>,
	smooth_rtt: Option<f64>,
	pending_ping_id: u8,
	pending_ping_sent_at: Option<Tick>,

	last_heartbeat: Tick,
	timeout_time_ms: u64,
	connect_timeout_time_ms: u64,
	can_timeout: bool,
	can_quality_disconnect: bool,

	max_send_attempts: u32,
	max_avg_send_attempts: f64,
	avg_send_attempts_resilience: u32,
	max_notify_loss: f64,
	notify_loss_resilience: u32,
	send_attempts_violations: u32,
	notify_loss_violations: u32,

	reliable: ReliableSequencer,
	notify: NotifySequencer,
	pending: HashMap<u16, PendingMessage>,

	metrics: ConnectionMetrics,
}

/// Parameters a `Connection` needs at construction time; everything else is a `PeerConfig` field
/// copied in so a later config change doesn't retroactively rewrite a live connection.
pub struct ConnectionParams {
	pub timeout_time_ms: u64,
	pub connect_timeout_time_ms: u64,
	pub max_send_attempts: u32,
	pub max_avg_send_attempts: f64,
	pub avg_send_attempts_resilience: u32,
	pub max_notify_loss: f64,
	pub notify_loss_resilience: u32,
	pub can_timeout: bool,
	pub can_quality_disconnect: bool,
}

impl Connection {
	pub fn new(endpoint: Endpoint, now: Tick, params: ConnectionParams) -> Self {
		Self {
			id: 0,
			endpoint,
			state: ConnectionState::Connecting,
			rtt: None,
			smooth_rtt: None,
			pending_ping_id: 0,
			pending_ping_sent_at: None,
			last_heartbeat: now,
			timeout_time_ms: params.timeout_time_ms,
			connect_timeout_time_ms: params.connect_timeout_time_ms,
			can_timeout: params.can_timeout,
			can_quality_disconnect: params.can_quality_disconnect,
			max_send_attempts: params.max_send_attempts,
			max_avg_send_attempts: params.max_avg_send_attempts,
			avg_send_attempts_resilience: params.avg_send_attempts_resilience,
			max_notify_loss: params.max_notify_loss,
			notify_loss_resilience: params.notify_loss_resilience,
			send_attempts_violations: 0,
			notify_loss_violations: 0,
			reliable: ReliableSequencer::new(),
			notify: NotifySequencer::new(),
			pending: HashMap::new(),
			metrics: ConnectionMetrics::new(),
		}
	}

	#[inline]
	pub fn id(&self) -> u16 {
		self.id
	}

	pub fn set_id(&mut self, id: u16) {
		self.id = id;
	}

	#[inline]
	pub fn endpoint(&self) -> Endpoint {
		self.endpoint
	}

	#[inline]
	pub fn state(&self) -> ConnectionState {
		self.state
	}

	#[inline]
	pub fn rtt_ms(&self) -> Option<u64> {
		self.rtt
	}

	#[inline]
	pub fn smooth_rtt_ms(&self) -> Option<f64> {
		self.smooth_rtt
	}

	#[inline]
	pub fn metrics(&self) -> &ConnectionMetrics {
		&self.metrics
	}

	#[inline]
	pub fn metrics_mut(&mut self) -> &mut ConnectionMetrics {
		&mut self.metrics
	}

	#[inline]
	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}

	pub fn set_timeout_time_ms(&mut self, ms: u64) {
		self.timeout_time_ms = ms;
	}

	// --- lifecycle (§4.6) ------------------------------------------------

	pub fn set_pending(&mut self, now: Tick) {
		self.state = ConnectionState::Pending;
		self.last_heartbeat = now;
	}

	pub fn set_connected(&mut self, now: Tick) {
		self.state = ConnectionState::Connected;
		self.last_heartbeat = now;
	}

	/// Tear the connection down locally, handing back every pending message's buffer for the
	/// caller to release into its pool.
	pub fn local_disconnect(&mut self) -> Vec<Message> {
		self.state = ConnectionState::NotConnected;
		self.pending.drain().map(|(_, p)| p.clear()).collect()
	}

	pub fn has_timed_out(&self, now: Tick) -> bool {
		self.can_timeout && now.0.saturating_sub(self.last_heartbeat.0) > self.timeout_time_ms
	}

	pub fn has_connect_attempt_timed_out(&self, now: Tick) -> bool {
		self.can_timeout && now.0.saturating_sub(self.last_heartbeat.0) > self.connect_timeout_time_ms
	}

	// --- heartbeat / RTT (§4.6) -------------------------------------------

	/// Build a fresh ping (the only side that calls this is whichever orchestrator actively
	/// probes RTT — the Client, per §4.8; a Server only ever echoes what it receives). Carries
	/// both the new ping id and our own current rtt estimate, mirroring `sendHeartbeat`.
	pub fn build_heartbeat_ping(&mut self, now: Tick) -> Vec<u8> {
		self.pending_ping_id = self.pending_ping_id.wrapping_add(1);
		self.pending_ping_sent_at = Some(now);
		self.encode_heartbeat_ping(self.pending_ping_id)
	}

	fn encode_heartbeat_ping(&self, ping_id: u8) -> Vec<u8> {
		let mut msg = Message::new(HeaderKind::Heartbeat, 3);
		msg.buf_mut().put_u8(ping_id).expect("heartbeat always fits its own header room");
		msg.buf_mut().put_u16(self.rtt.map(|r| r.min(u16::MAX as u64) as u16).unwrap_or(0)).expect("heartbeat always fits its own header room");
		msg.as_bytes().to_vec()
	}

	/// A reply carries only the matching ping id, never an rtt sample — `respondHeartbeat` never
	/// measures its own rtt, it just echoes what it was asked to acknowledge.
	fn encode_heartbeat_reply(ping_id: u8) -> Vec<u8> {
		let mut msg = Message::new(HeaderKind::Heartbeat, 1);
		msg.buf_mut().put_u8(ping_id).expect("heartbeat always fits its own header room");
		msg.as_bytes().to_vec()
	}

	/// A Heartbeat frame arrived carrying the remote's own ping id and its current rtt estimate.
	/// Resets the timeout unconditionally and echoes the ping id back alone, adopting the
	/// remote's reported rtt directly rather than measuring our own — mirroring `connection.py`'s
	/// `handleHeartbeat`/`respondHeartbeat` pair, which never initiates pings of its own on the
	/// receiving side and never carries an rtt sample on the reply.
	pub fn handle_heartbeat_ping(&mut self, ping_id: u8, remote_rtt_ms: u16, now: Tick) -> Vec<u8> {
		if remote_rtt_ms > 0 {
			self.rtt = Some(remote_rtt_ms as u64);
			self.bump_smooth_rtt(remote_rtt_ms as f64);
		}
		self.last_heartbeat = now;
		Self::encode_heartbeat_reply(ping_id)
	}

	/// A Heartbeat frame arrived that might be the echo of our own outstanding ping. Returns
	/// whether it matched and produced a fresh rtt sample; a mismatched id is ignored rather than
	/// treated as a fresh ping to answer (§9 supplemented ping-id bookkeeping), but the timeout is
	/// still reset — any contact from the peer counts as liveness.
	pub fn handle_heartbeat_response(&mut self, ping_id: u8, now: Tick) -> bool {
		let matched = self.pending_ping_sent_at.is_some() && ping_id == self.pending_ping_id;

		if matched {
			let sent_at = self.pending_ping_sent_at.take().expect("matched implies present");
			let sample = now.0.saturating_sub(sent_at.0).max(1) as f64;
			self.rtt = Some(sample as u64);
			self.bump_smooth_rtt(sample);
		}

		self.last_heartbeat = now;
		matched
	}

	fn bump_smooth_rtt(&mut self, sample: f64) {
		self.smooth_rtt = Some(match self.smooth_rtt {
			None => sample.max(1.0),
			Some(prev) => (prev * 0.7 + sample * 0.3).max(1.0),
		});
	}

	// --- quality-based self-disconnect (§4.6) -----------------------------

	/// Run once per heartbeat tick (§5: "Timeouts ... are checked at heartbeat ticks"), advancing
	/// or resetting the two independent violation counters and returning a disconnect request once
	/// either counter reaches its configured resilience.
	pub fn check_quality(&mut self) -> Option<DisconnectReason> {
		let over_send_attempts = self.metrics.rolling_reliable_sends.mean().is_some_and(|m| m > self.max_avg_send_attempts);

		self.send_attempts_violations = if over_send_attempts { self.send_attempts_violations + 1 } else { 0 };

		let over_notify_loss = self.metrics.rolling_notify_loss_rate() > self.max_notify_loss;
		self.notify_loss_violations = if over_notify_loss { self.notify_loss_violations + 1 } else { 0 };

		if !self.can_quality_disconnect {
			return None;
		}

		if self.send_attempts_violations >= self.avg_send_attempts_resilience || self.notify_loss_violations >= self.notify_loss_resilience {
			warn!("connection {} to {} tripped quality disconnect (send_attempts_violations={}, notify_loss_violations={})", self.id, self.endpoint, self.send_attempts_violations, self.notify_loss_violations);
			Some(DisconnectReason::PoorConnection)
		} else {
			None
		}
	}

	// --- unreliable / notify sends (§4.6) ---------------------------------

	pub fn send_unreliable(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>, pool: &mut Pool) -> ProtoResult<Vec<u8>> {
		let mut msg = pool.acquire(HeaderKind::Unreliable);
		msg.set_msg_id(msg_id)?;
		write_payload(msg.buf_mut())?;
		let bytes = msg.as_bytes().to_vec();
		self.metrics.sent_unreliable(bytes.len() as u64);
		pool.release(msg);
		Ok(bytes)
	}

	pub fn send_notify(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>, pool: &mut Pool) -> ProtoResult<Vec<u8>> {
		let (_seq, packed) = self.notify.insert_header();
		let (last_recv, first8, this_seq) = Message::unpack_notify_bits(packed);

		let mut msg = pool.acquire(HeaderKind::Notify);
		msg.set_notify_bits(last_recv, first8, this_seq)?;
		msg.set_msg_id(msg_id)?;
		write_payload(msg.buf_mut())?;
		let bytes = msg.as_bytes().to_vec();
		self.metrics.sent_notify(bytes.len() as u64);
		pool.release(msg);
		Ok(bytes)
	}

	/// Fold an incoming Notify frame's piggybacked ack field into our own notify sequencer and
	/// decide whether this frame itself is fresh enough to deliver (§4.4.2).
	pub fn process_notify(&mut self, message: &Message) -> NotifyOutcome {
		let packed = message.notify_bits().expect("classify() only routes Notify-tagged frames here");
		let (remote_last_received, remote_bits8, this_seq) = Message::unpack_notify_bits(packed);

		let verdicts = self.notify.update_received_acks(remote_last_received, remote_bits8);

		for verdict in &verdicts {
			self.metrics.record_notify_verdict(matches!(verdict, NotifyVerdict::Delivered(_)));
		}

		let should_deliver = self.notify.should_handle(this_seq);
		self.metrics.received_notify(message.as_bytes().len() as u64);

		if !should_deliver {
			self.metrics.increment_notify_discarded();
		}

		NotifyOutcome { should_deliver, verdicts }
	}

	// --- reliable-class sends (Reliable, Welcome, ClientConnected, ClientDisconnected) ------

	fn send_reliable_class(&mut self, kind: HeaderKind, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>, pool: &mut Pool, now: Tick) -> ProtoResult<(u16, Vec<u8>, u64)> {
		let seq = self.reliable.next_sequence_id();
		let mut msg = pool.acquire(kind);
		msg.set_seq_id(seq)?;
		write_payload(msg.buf_mut())?;

		let mut pending = PendingMessage::new(msg);

		match pending.try_send(now, self.smooth_rtt, self.can_quality_disconnect, self.max_send_attempts) {
			TrySendOutcome::Sent { bytes, retry_delay_ms } => {
				if kind == HeaderKind::Reliable {
					self.metrics.sent_reliable(bytes.len() as u64);
				}

				self.pending.insert(seq, pending);
				Ok((seq, bytes, retry_delay_ms))
			}
			TrySendOutcome::Disconnect(_) => {
				unreachable!("a freshly built pending message cannot already be over its attempt ceiling")
			}
		}
	}

	pub fn send_reliable(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>, pool: &mut Pool, now: Tick) -> ProtoResult<(u16, Vec<u8>, u64)> {
		self.send_reliable_class(HeaderKind::Reliable, |buf| buf.put_varulong(msg_id).and_then(|_| write_payload(buf)), pool, now)
	}

	pub fn send_welcome(&mut self, pool: &mut Pool, now: Tick) -> ProtoResult<(u16, Vec<u8>, u64)> {
		let id = self.id;
		self.send_reliable_class(HeaderKind::Welcome, move |buf| buf.put_u16(id), pool, now)
	}

	/// Client side of the handshake (§4.8 "Welcome → `connection.handle_welcome`"): the server's
	/// Welcome carries the id it assigned us. Adopt it, move to Connected, and hand back the echo
	/// frame the caller must send back — mirroring `handleWelcome` calling `respondWelcome`,
	/// the server does not consider us connected until that echo arrives.
	pub fn handle_welcome(&mut self, assigned_id: u16, pool: &mut Pool, now: Tick) -> ProtoResult<Vec<u8>> {
		self.id = assigned_id;
		self.set_connected(now);
		self.build_welcome_echo(pool)
	}

	fn build_welcome_echo(&mut self, pool: &mut Pool) -> ProtoResult<Vec<u8>> {
		let seq = self.reliable.next_sequence_id();
		let mut msg = pool.acquire(HeaderKind::Welcome);
		msg.set_seq_id(seq)?;
		msg.buf_mut().put_u16(self.id)?;
		let bytes = msg.as_bytes().to_vec();
		pool.release(msg);
		Ok(bytes)
	}

	/// Server side of the handshake: a Welcome frame arriving back from a connection still
	/// sitting in the pending list is the client's echo, not a fresh Welcome to answer. If the id
	/// it echoes doesn't match what we assigned, ignore it (mirrors `handleWelcomeResponse`'s id
	/// mismatch guard) rather than trusting an unrelated reply into Connected.
	pub fn handle_welcome_response(&mut self, echoed_id: u16, now: Tick) -> bool {
		if echoed_id != self.id {
			warn!("connection at {} echoed welcome id {} but was assigned {}", self.endpoint, echoed_id, self.id);
			return false;
		}

		self.set_connected(now);
		true
	}

	pub fn send_client_connected(&mut self, announced_id: u16, pool: &mut Pool, now: Tick) -> ProtoResult<(u16, Vec<u8>, u64)> {
		self.send_reliable_class(HeaderKind::ClientConnected, move |buf| buf.put_u16(announced_id), pool, now)
	}

	pub fn send_client_disconnected(&mut self, announced_id: u16, pool: &mut Pool, now: Tick) -> ProtoResult<(u16, Vec<u8>, u64)> {
		self.send_reliable_class(HeaderKind::ClientDisconnected, move |buf| buf.put_u16(announced_id), pool, now)
	}

	// --- reliable receive path (§4.4.1, §4.6) -----------------------------

	/// Whether an incoming Reliable-class frame with this sequence id is fresh, and the selective
	/// ack to send back regardless of the outcome (§4.4.1).
	pub fn should_handle_reliable(&mut self, seq: u16, pool: &mut Pool) -> (bool, Vec<u8>) {
		let handled = self.reliable.should_handle(seq);

		if handled {
			self.metrics.increment_reliable_uniques();
		}

		(handled, self.build_selective_ack(seq, pool))
	}

	fn build_selective_ack(&self, incoming_seq: u16, pool: &mut Pool) -> Vec<u8> {
		let mut msg = pool.acquire(HeaderKind::Ack);
		let last_received = self.reliable.last_received_seq_id();

		msg.buf_mut().put_u16(last_received).expect("ack always fits its own header room");
		msg.buf_mut().put_u16(self.reliable.received_seq_ids_first_16()).expect("ack always fits its own header room");

		let explicit = incoming_seq != last_received;
		msg.buf_mut().put_bool(explicit).expect("ack always fits its own header room");

		if explicit {
			msg.buf_mut().put_u16(incoming_seq).expect("ack always fits its own header room");
		}

		let bytes = msg.as_bytes().to_vec();
		pool.release(msg);
		bytes
	}

	/// Fold a received Ack frame into the reliable sequencer, resending or clearing pending
	/// messages as the selective-ack bitfield dictates (§4.4.1).
	pub fn handle_ack(&mut self, remote_last_received: u16, remote_bits16: u16, now: Tick, pool: &mut Pool) -> AckEffects {
		let actions = self.reliable.update_received_acks(remote_last_received, remote_bits16 as u32);
		let mut effects = AckEffects::default();

		for action in actions {
			match action {
				AckAction::Resend(seq) => {
					let Some(pending) = self.pending.get_mut(&seq) else { continue };

					match pending.try_send(now, self.smooth_rtt, self.can_quality_disconnect, self.max_send_attempts) {
						TrySendOutcome::Sent { bytes, retry_delay_ms } => effects.resends.push((seq, bytes, retry_delay_ms)),
						TrySendOutcome::Disconnect(reason) => {
							if let Some(p) = self.pending.remove(&seq) {
								pool.release(p.clear());
							}
							effects.disconnect = Some(reason);
						}
					}
				}
				AckAction::Clear(seq) => self.clear_pending(seq, pool),
			}
		}

		effects
	}

	/// A due `PendingMessageRetry` event fired for `seq`; `None` if the message was already
	/// cleared (a stale retry, per §9's event-scheduling note).
	pub fn retry_pending(&mut self, seq: u16, now: Tick, pool: &mut Pool) -> Option<PendingRetryEffect> {
		let outcome = {
			let pending = self.pending.get_mut(&seq)?;
			pending.retry_send(now, self.smooth_rtt, self.can_quality_disconnect, self.max_send_attempts)
		};

		match outcome {
			RetryOutcome::AlreadyCleared => {
				if let Some(p) = self.pending.remove(&seq) {
					pool.release(p.clear());
				}
				None
			}
			RetryOutcome::Rescheduled { delay_ms } => Some(PendingRetryEffect::Reschedule { delay_ms }),
			RetryOutcome::Attempted(TrySendOutcome::Sent { bytes, retry_delay_ms }) => Some(PendingRetryEffect::Resend { bytes, retry_delay_ms }),
			RetryOutcome::Attempted(TrySendOutcome::Disconnect(reason)) => {
				if let Some(p) = self.pending.remove(&seq) {
					pool.release(p.clear());
				}
				Some(PendingRetryEffect::Disconnect(reason))
			}
		}
	}

	fn clear_pending(&mut self, seq: u16, pool: &mut Pool) {
		let Some(pending) = self.pending.remove(&seq) else {
			return;
		};

		let attempts = pending.send_attempts();
		pool.release(pending.clear());
		self.metrics.rolling_reliable_sends.record(attempts as f64);
	}

	// --- disconnect frame (Unreliable-class, no retransmission) -----------

	pub fn build_disconnect(reason: DisconnectReason, extra: Option<&[u8]>, pool: &mut Pool) -> CodecResult<Vec<u8>> {
		let mut msg = pool.acquire(HeaderKind::Disconnect);
		msg.buf_mut().put_u8(reason as u8)?;

		if let Some(extra) = extra {
			for &b in extra {
				msg.buf_mut().put_u8(b)?;
			}
		}

		let bytes = msg.as_bytes().to_vec();
		pool.release(msg);
		Ok(bytes)
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("endpoint", &self.endpoint)
			.field("state", &self.state)
			.field("rtt", &self.rtt)
			.field("pending", &self.pending.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::SocketAddr;

	fn endpoint() -> Endpoint {
		"127.0.0.1:9000".parse::<SocketAddr>().unwrap()
	}

	fn params() -> ConnectionParams {
		ConnectionParams {
			timeout_time_ms: 5000,
			connect_timeout_time_ms: 10_000,
			max_send_attempts: 15,
			max_avg_send_attempts: 5.0,
			avg_send_attempts_resilience: 64,
			max_notify_loss: 0.05,
			notify_loss_resilience: 64,
			can_timeout: true,
			can_quality_disconnect: true,
		}
	}

	#[test]
	fn starts_connecting_and_walks_the_lifecycle() {
		let mut conn = Connection::new(endpoint(), Tick(0), params());
		assert_eq!(conn.state(), ConnectionState::Connecting);
		conn.set_pending(Tick(10));
		assert_eq!(conn.state(), ConnectionState::Pending);
		conn.set_connected(Tick(20));
		assert_eq!(conn.state(), ConnectionState::Connected);
		conn.local_disconnect();
		assert_eq!(conn.state(), ConnectionState::NotConnected);
	}

	#[test]
	fn timeout_only_trips_once_idle_past_the_configured_window() {
		let conn = Connection::new(endpoint(), Tick(0), params());
		assert!(!conn.has_timed_out(Tick(4999)));
		assert!(conn.has_timed_out(Tick(5001)));
	}

	#[test]
	fn heartbeat_ping_and_response_produce_a_matching_rtt_sample() {
		let mut conn = Connection::new(endpoint(), Tick(0), params());
		conn.build_heartbeat_ping(Tick(0));
		assert!(conn.handle_heartbeat_response(conn.pending_ping_id, Tick(40)));
		assert_eq!(conn.rtt_ms(), Some(40));
		assert_eq!(conn.smooth_rtt_ms(), Some(40.0));
	}

	#[test]
	fn mismatched_heartbeat_response_is_ignored_but_still_resets_timeout() {
		let mut conn = Connection::new(endpoint(), Tick(0), params());
		conn.build_heartbeat_ping(Tick(0));
		assert!(!conn.handle_heartbeat_response(conn.pending_ping_id.wrapping_add(1), Tick(9999)));
		assert_eq!(conn.rtt_ms(), None);
		assert!(!conn.has_timed_out(Tick(9999)));
	}

	#[test]
	fn reliable_round_trip_drains_the_pending_map_after_the_ack_returns() {
		let mut pool = Pool::default();
		let mut sender = Connection::new(endpoint(), Tick(0), params());
		let mut receiver = Connection::new(endpoint(), Tick(0), params());

		for i in 0..100u64 {
			let (seq, bytes, _delay) = sender.send_reliable(i, |_| Ok(()), &mut pool, Tick(0)).unwrap();
			assert_eq!(sender.pending_count(), 1);

			let mut msg = Message::new(HeaderKind::Reliable, 64);
			msg.load(&bytes).unwrap();
			msg.parse_header().unwrap();
			assert_eq!(msg.seq_id(), Some(seq));

			let (handled, ack_bytes) = receiver.should_handle_reliable(seq, &mut pool);
			assert!(handled);

			let mut ack = Message::new(HeaderKind::Ack, 64);
			ack.load(&ack_bytes).unwrap();
			ack.buf_mut().seek_read(4);
			let last_received = ack.buf_mut().get_u16().unwrap();
			let bits16 = ack.buf_mut().get_u16().unwrap();

			sender.handle_ack(last_received, bits16, Tick(0), &mut pool);
		}

		assert_eq!(sender.pending_count(), 0);
	}

	#[test]
	fn duplicate_reliable_frames_are_never_handled_twice() {
		let mut pool = Pool::default();
		let mut conn = Connection::new(endpoint(), Tick(0), params());
		let (first, _) = conn.should_handle_reliable(5, &mut pool);
		let (second, _) = conn.should_handle_reliable(5, &mut pool);
		assert!(first);
		assert!(!second);
	}

	#[test]
	fn notify_send_and_receive_resolve_to_exactly_one_verdict_each() {
		let mut pool = Pool::default();
		let mut a = Connection::new(endpoint(), Tick(0), params());
		let mut b = Connection::new(endpoint(), Tick(0), params());

		let bytes = a.send_notify(1, |_| Ok(()), &mut pool).unwrap();
		let mut msg = Message::new(HeaderKind::Notify, 64);
		msg.load(&bytes).unwrap();
		msg.parse_header().unwrap();

		let outcome = b.process_notify(&msg);
		assert!(outcome.should_deliver);

		// b's next outgoing notify echoes its received state back to a, resolving a's send.
		let echo_bytes = b.send_notify(2, |_| Ok(()), &mut pool).unwrap();
		let mut echo = Message::new(HeaderKind::Notify, 64);
		echo.load(&echo_bytes).unwrap();
		echo.parse_header().unwrap();

		let a_outcome = a.process_notify(&echo);
		assert_eq!(a_outcome.verdicts.len(), 1);
		assert!(matches!(a_outcome.verdicts[0], NotifyVerdict::Delivered(_)));
	}

	#[test]
	fn quality_disconnect_trips_after_sustained_high_send_attempts() {
		let mut pool = Pool::default();
		let mut conn = Connection::new(endpoint(), Tick(0), params());

		for _ in 0..conn.avg_send_attempts_resilience {
			conn.metrics.rolling_reliable_sends.record(10.0);
			assert_eq!(conn.check_quality(), None);
		}

		// One more over-threshold tick than the configured resilience trips the disconnect.
		conn.metrics.rolling_reliable_sends.record(10.0);
		assert_eq!(conn.check_quality(), Some(DisconnectReason::PoorConnection));
		let _ = pool.len();
	}

	#[test]
	fn local_disconnect_releases_every_pending_message() {
		let mut pool = Pool::default();
		let mut conn = Connection::new(endpoint(), Tick(0), params());
		conn.send_reliable(1, |_| Ok(()), &mut pool, Tick(0)).unwrap();
		conn.send_reliable(2, |_| Ok(()), &mut pool, Tick(0)).unwrap();

		let released = conn.local_disconnect();
		assert_eq!(released.len(), 2);
		assert_eq!(conn.pending_count(), 0);
	}

	#[test]
	fn heartbeat_reply_carries_only_the_ping_id() {
		let mut ping = Connection::new(endpoint(), Tick(0), params());
		let mut pong = Connection::new(endpoint(), Tick(0), params());

		let ping_bytes = ping.build_heartbeat_ping(Tick(0));
		let mut ping_msg = Message::new(HeaderKind::Heartbeat, 64);
		ping_msg.load(&ping_bytes).unwrap();
		ping_msg.parse_header().unwrap();
		let ping_id = ping_msg.buf_mut().get_u8().unwrap();
		let _ping_rtt = ping_msg.buf_mut().get_u16().unwrap();

		let reply_bytes = pong.handle_heartbeat_ping(ping_id, 40, Tick(0));
		assert!(reply_bytes.len() < ping_bytes.len());

		let mut reply_msg = Message::new(HeaderKind::Heartbeat, 64);
		reply_msg.load(&reply_bytes).unwrap();
		reply_msg.parse_header().unwrap();
		assert_eq!(reply_msg.buf_mut().get_u8().unwrap(), ping_id);
		assert!(reply_msg.buf_mut().get_u16().is_err());
	}

	#[test]
	fn welcome_handshake_completes_only_after_the_client_echoes_it_back() {
		let mut pool = Pool::default();
		let mut server_side = Connection::new(endpoint(), Tick(0), params());
		let mut client_side = Connection::new(endpoint(), Tick(0), params());

		server_side.set_id(7);
		let (_seq, welcome_bytes, _delay) = server_side.send_welcome(&mut pool, Tick(0)).unwrap();

		let mut welcome = Message::new(HeaderKind::Welcome, 64);
		welcome.load(&welcome_bytes).unwrap();
		welcome.parse_header().unwrap();
		let assigned_id = welcome.buf_mut().get_u16().unwrap();

		let echo_bytes = client_side.handle_welcome(assigned_id, &mut pool, Tick(10)).unwrap();
		assert_eq!(client_side.id(), 7);
		assert_eq!(client_side.state(), ConnectionState::Connected);

		let mut echo = Message::new(HeaderKind::Welcome, 64);
		echo.load(&echo_bytes).unwrap();
		echo.parse_header().unwrap();
		let echoed_id = echo.buf_mut().get_u16().unwrap();

		assert_ne!(server_side.state(), ConnectionState::Connected);
		assert!(server_side.handle_welcome_response(echoed_id, Tick(20)));
		assert_eq!(server_side.state(), ConnectionState::Connected);
	}

	#[test]
	fn welcome_response_with_a_mismatched_id_is_ignored() {
		let mut pool = Pool::default();
		let mut server_side = Connection::new(endpoint(), Tick(0), params());
		server_side.set_id(7);
		let _ = server_side.send_welcome(&mut pool, Tick(0)).unwrap();

		assert!(!server_side.handle_welcome_response(99, Tick(20)));
		assert_ne!(server_side.state(), ConnectionState::Connected);
	}
}
