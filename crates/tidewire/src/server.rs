//! The Server orchestrator: client-id pool, pending-accept admission, broadcast, the relay
//! filter, and the heartbeat sweep for timeouts (§4.9).
//!
//! Where [`Client`](crate::client::Client) owns a single [`Connection`], a `Server` owns up to
//! `max_client_count` of them, keyed by the lowest-available client id (1-based), plus a list of
//! connections still waiting on admission. Dispatch otherwise mirrors the client's: events before
//! polled data, control frames interpreted inline, user frames handed to per-`msg_id` handlers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tidewire_collections::message::BitBuffer;
use tidewire_collections::Message;
use tidewire_runtime::{EventPayload, Tick};
use tidewire_transport::{Endpoint, Transport};
use tidewire_utils::error::{CodecResult, ProtoError, ProtoResult};
use tidewire_utils::wire::{DisconnectReason, HeaderKind, RejectReason};

use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionParams, PendingRetryEffect};
use crate::events::{EventList, SubscriptionId};
use crate::framing::ClassifiedFrame;
use crate::peer::{InboundFrame, Peer};

#[derive(Debug, Clone, Copy)]
pub struct ClientConnectedEvent {
	pub id: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientDisconnectedEvent {
	pub id: u16,
	pub reason: DisconnectReason,
}

/// A pending (pre-admission) connection attempt that never reached Connected — refused, timed
/// out, or the remote gave up — distinct from `ClientDisconnectedEvent`, which only covers
/// clients that had already been welcomed (§4.9 "emits ... ConnectionFailed if still Pending").
#[derive(Debug, Clone, Copy)]
pub struct ConnectionAttemptFailedEvent {
	pub endpoint: Endpoint,
	pub reason: DisconnectReason,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
	pub from: u16,
	pub msg_id: u64,
	pub message: Message,
}

pub struct Server {
	peer: Peer,
	max_client_count: u16,
	connections: HashMap<u16, Connection>,
	endpoint_to_id: HashMap<Endpoint, u16>,
	pending: Vec<Connection>,
	free_ids: BinaryHeap<Reverse<u16>>,
	relay_filter: Option<HashSet<u64>>,
	admission: Option<Box<dyn FnMut(Endpoint) -> bool + Send>>,

	pub client_connected: EventList<ClientConnectedEvent>,
	pub client_disconnected: EventList<ClientDisconnectedEvent>,
	pub connection_attempt_failed: EventList<ConnectionAttemptFailedEvent>,
	message_handlers: HashMap<u64, EventList<ReceivedMessage>>,
}

impl Server {
	pub fn new(transport: Box<dyn Transport>, config: PeerConfig, max_client_count: u16) -> Self {
		Self {
			peer: Peer::new(transport, config),
			max_client_count,
			connections: HashMap::new(),
			endpoint_to_id: HashMap::new(),
			pending: Vec::new(),
			free_ids: (1..=max_client_count).map(Reverse).collect(),
			relay_filter: None,
			admission: None,
			client_connected: EventList::new(),
			client_disconnected: EventList::new(),
			connection_attempt_failed: EventList::new(),
			message_handlers: HashMap::new(),
		}
	}

	#[inline]
	pub fn max_client_count(&self) -> u16 {
		self.max_client_count
	}

	#[inline]
	pub fn client_count(&self) -> usize {
		self.connections.len()
	}

	#[inline]
	pub fn client_ids(&self) -> impl Iterator<Item = u16> + '_ {
		self.connections.keys().copied()
	}

	pub fn rtt_ms(&self, id: u16) -> Option<u64> {
		self.connections.get(&id).and_then(Connection::rtt_ms)
	}

	pub fn start(&mut self, port: u16) -> ProtoResult<()> {
		self.peer.start(port)
	}

	/// Kick every connected client with `ServerStopped`, then release the transport.
	pub fn shutdown(&mut self) {
		let ids: Vec<u16> = self.connections.keys().copied().collect();

		for id in ids {
			let _ = self.disconnect_client(id, DisconnectReason::ServerStopped, None);
		}

		self.peer.shutdown();
	}

	/// Install a callback consulted on every `Connect` once the basic checks (not already
	/// connected, server not full) pass (§4.9 "admission callback").
	pub fn set_admission_callback(&mut self, callback: impl FnMut(Endpoint) -> bool + Send + 'static) {
		self.admission = Some(Box::new(callback));
	}

	/// Admit a connection the host decided to accept outside the synchronous admission callback
	/// (e.g. after its own out-of-band check) — a no-op if `endpoint` isn't awaiting admission.
	pub fn accept_connection(&mut self, endpoint: Endpoint) -> ProtoResult<()> {
		self.admit(endpoint)
	}

	/// Turn away a connection the host decided to reject outside the synchronous admission
	/// callback — a no-op if `endpoint` isn't awaiting admission.
	pub fn reject_connection(&mut self, endpoint: Endpoint, reason: RejectReason) -> ProtoResult<()> {
		if let Some(idx) = self.pending.iter().position(|c| c.endpoint() == endpoint) {
			let conn = self.pending.remove(idx);
			self.fail_pending(conn, DisconnectReason::ConnectionRejected);
		}

		self.send_reject(endpoint, reason)
	}

	pub fn set_relay_filter(&mut self, ids: HashSet<u64>) {
		self.relay_filter = Some(ids);
	}

	pub fn clear_relay_filter(&mut self) {
		self.relay_filter = None;
	}

	pub fn add_relay_id(&mut self, msg_id: u64) {
		self.relay_filter.get_or_insert_with(HashSet::new).insert(msg_id);
	}

	pub fn remove_relay_id(&mut self, msg_id: u64) {
		if let Some(filter) = self.relay_filter.as_mut() {
			filter.remove(&msg_id);
		}
	}

	pub fn on_message(&mut self, msg_id: u64, handler: impl FnMut(&ReceivedMessage) + Send + 'static) -> SubscriptionId {
		self.message_handlers.entry(msg_id).or_default().subscribe(handler)
	}

	pub fn send_unreliable_to(&mut self, id: u16, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>) -> ProtoResult<()> {
		let Some(conn) = self.connections.get_mut(&id) else {
			return Err(no_such_client(id));
		};
		let endpoint = conn.endpoint();
		let bytes = conn.send_unreliable(msg_id, write_payload, self.peer.pool_mut())?;
		self.peer.send(endpoint, &bytes)
	}

	pub fn send_notify_to(&mut self, id: u16, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>) -> ProtoResult<()> {
		let Some(conn) = self.connections.get_mut(&id) else {
			return Err(no_such_client(id));
		};
		let endpoint = conn.endpoint();
		let bytes = conn.send_notify(msg_id, write_payload, self.peer.pool_mut())?;
		self.peer.send(endpoint, &bytes)
	}

	pub fn send_reliable_to(&mut self, id: u16, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>) -> ProtoResult<()> {
		let now = self.peer.now();

		let Some(conn) = self.connections.get_mut(&id) else {
			return Err(no_such_client(id));
		};

		let endpoint = conn.endpoint();
		let (seq, bytes, retry_delay_ms) = conn.send_reliable(msg_id, write_payload, self.peer.pool_mut(), now)?;

		self.peer.send(endpoint, &bytes)?;
		self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: id, seq_id: seq });
		Ok(())
	}

	/// Broadcast an Unreliable message, building the payload once and releasing it once (§4.9
	/// `send_to_all`); Reliable/Notify broadcasts need a distinct sequence id per connection, so
	/// they are not offered as a single-buffer primitive.
	pub fn send_to_all(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>, except: Option<u16>) -> ProtoResult<()> {
		let mut msg = self.peer.pool_mut().acquire(HeaderKind::Unreliable);
		msg.set_msg_id(msg_id)?;
		write_payload(msg.buf_mut())?;
		let bytes = msg.as_bytes().to_vec();
		self.peer.pool_mut().release(msg);

		let targets: Vec<(u16, Endpoint)> = self.connections.iter().filter(|(&id, _)| Some(id) != except).map(|(&id, c)| (id, c.endpoint())).collect();

		for (id, endpoint) in targets {
			self.peer.send(endpoint, &bytes)?;

			if let Some(conn) = self.connections.get_mut(&id) {
				conn.metrics_mut().sent_unreliable(bytes.len() as u64);
			}
		}

		Ok(())
	}

	pub fn disconnect_client(&mut self, id: u16, reason: DisconnectReason, payload: Option<&[u8]>) -> ProtoResult<()> {
		let Some(conn) = self.connections.get(&id) else {
			return Ok(());
		};

		let endpoint = conn.endpoint();
		let bytes = Connection::build_disconnect(reason, payload, self.peer.pool_mut())?;
		self.peer.send(endpoint, &bytes)?;
		self.local_disconnect(id, reason)
	}

	pub fn update(&mut self) -> ProtoResult<()> {
		let tick = self.peer.update();

		for (endpoint, reason) in tick.disconnected {
			if let Some(&id) = self.endpoint_to_id.get(&endpoint) {
				self.local_disconnect(id, reason)?;
			} else if let Some(idx) = self.pending.iter().position(|c| c.endpoint() == endpoint) {
				let conn = self.pending.remove(idx);
				self.fail_pending(conn, reason);
			}
		}

		for event in tick.due {
			match event {
				EventPayload::HeartbeatTick => self.on_heartbeat_tick(tick.now)?,
				EventPayload::PendingMessageRetry { connection_id, seq_id } => self.on_pending_retry(connection_id, seq_id, tick.now)?,
			}
		}

		for frame in tick.inbound {
			self.handle_frame(frame)?;
		}

		Ok(())
	}

	fn on_heartbeat_tick(&mut self, now: Tick) -> ProtoResult<()> {
		let heartbeat_interval_ms = self.peer.config().heartbeat_interval_ms;

		let mut timed_out_pending = Vec::new();
		for (idx, conn) in self.pending.iter().enumerate() {
			if conn.has_connect_attempt_timed_out(now) {
				timed_out_pending.push(idx);
			}
		}
		for idx in timed_out_pending.into_iter().rev() {
			let conn = self.pending.remove(idx);
			self.fail_pending(conn, DisconnectReason::NeverConnected);
		}

		let mut to_disconnect = Vec::new();
		for (&id, conn) in self.connections.iter_mut() {
			if conn.has_timed_out(now) {
				to_disconnect.push((id, DisconnectReason::TimedOut));
			} else if let Some(reason) = conn.check_quality() {
				to_disconnect.push((id, reason));
			}
		}
		for (id, reason) in to_disconnect {
			self.local_disconnect(id, reason)?;
		}

		self.peer.execute_later(heartbeat_interval_ms, EventPayload::HeartbeatTick);
		Ok(())
	}

	fn on_pending_retry(&mut self, connection_id: u16, seq_id: u16, now: Tick) -> ProtoResult<()> {
		// The retried message may belong to a fully connected client, or to one still awaiting
		// its Welcome echo (admit() leaves it in `pending` with an id already assigned).
		let conn = match self.connections.get_mut(&connection_id) {
			Some(conn) => conn,
			None => match self.pending.iter_mut().find(|c| c.id() == connection_id) {
				Some(conn) => conn,
				None => return Ok(()),
			},
		};

		let endpoint = conn.endpoint();
		let effect = conn.retry_pending(seq_id, now, self.peer.pool_mut());

		match effect {
			Some(PendingRetryEffect::Resend { bytes, retry_delay_ms }) => {
				self.peer.send(endpoint, &bytes)?;
				self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id, seq_id });
			}
			Some(PendingRetryEffect::Reschedule { delay_ms }) => {
				self.peer.execute_later(delay_ms, EventPayload::PendingMessageRetry { connection_id, seq_id });
			}
			Some(PendingRetryEffect::Disconnect(reason)) => self.abandon_connection(connection_id, reason)?,
			None => {}
		}

		Ok(())
	}

	/// Tear down a connection by id regardless of which bucket it's currently in — connected, or
	/// still pending its Welcome echo.
	fn abandon_connection(&mut self, id: u16, reason: DisconnectReason) -> ProtoResult<()> {
		if self.connections.contains_key(&id) {
			return self.local_disconnect(id, reason);
		}

		if let Some(idx) = self.pending.iter().position(|c| c.id() == id) {
			let conn = self.pending.remove(idx);
			self.fail_pending(conn, reason);
		}

		Ok(())
	}

	fn handle_frame(&mut self, inbound: InboundFrame) -> ProtoResult<()> {
		let InboundFrame { endpoint, frame } = inbound;

		if let ClassifiedFrame::Control(ref msg) = frame {
			if msg.kind() == HeaderKind::Connect {
				return self.handle_connect(endpoint);
			}
		}

		let now = self.peer.now();

		let Some(&id) = self.endpoint_to_id.get(&endpoint) else {
			return match frame {
				ClassifiedFrame::Control(msg) if msg.kind() == HeaderKind::Welcome => self.handle_welcome_echo(endpoint, msg, now),
				_ => {
					if !self.pending.iter().any(|c| c.endpoint() == endpoint) {
						self.send_reject(endpoint, RejectReason::NoConnection)?;
					}
					Ok(())
				}
			};
		};

		match frame {
			ClassifiedFrame::UnreliableUser(mut msg) => {
				if let Some(conn) = self.connections.get_mut(&id) {
					conn.metrics_mut().received_unreliable(msg.as_bytes().len() as u64);
				}

				self.maybe_relay(id, &mut msg)?;
				self.dispatch_message(id, msg);
			}
			ClassifiedFrame::ReliableUser(mut msg) => {
				let seq = msg.seq_id().expect("ReliableUser frames always carry a sequence id");
				let Some(conn) = self.connections.get_mut(&id) else { return Ok(()) };

				let (handled, ack_bytes) = conn.should_handle_reliable(seq, self.peer.pool_mut());
				self.peer.send(endpoint, &ack_bytes)?;

				if handled {
					conn.metrics_mut().received_reliable(msg.as_bytes().len() as u64);
					self.maybe_relay(id, &mut msg)?;
					self.dispatch_message(id, msg);
				} else {
					conn.metrics_mut().increment_reliable_discarded();
				}
			}
			ClassifiedFrame::Notify(mut msg) => {
				let Some(conn) = self.connections.get_mut(&id) else { return Ok(()) };
				let outcome = conn.process_notify(&msg);

				if outcome.should_deliver {
					self.maybe_relay(id, &mut msg)?;
					self.dispatch_message(id, msg);
				}
			}
			ClassifiedFrame::Control(msg) => self.handle_control(id, msg, endpoint, now)?,
			ClassifiedFrame::Malformed => unreachable!("Peer::update already filters malformed frames"),
		}

		Ok(())
	}

	fn handle_connect(&mut self, endpoint: Endpoint) -> ProtoResult<()> {
		if self.endpoint_to_id.contains_key(&endpoint) {
			return self.send_reject(endpoint, RejectReason::AlreadyConnected);
		}

		if let Some(idx) = self.pending.iter().position(|c| c.endpoint() == endpoint) {
			let now = self.peer.now();
			self.pending[idx].set_pending(now);
			return Ok(());
		}

		if self.connections.len() >= self.max_client_count as usize {
			return self.send_reject(endpoint, RejectReason::ServerFull);
		}

		let now = self.peer.now();
		let config = *self.peer.config();
		let mut conn = Connection::new(endpoint, now, connection_params(&config));
		conn.set_pending(now);
		self.pending.push(conn);

		let accept = match self.admission.as_mut() {
			Some(callback) => callback(endpoint),
			None => true,
		};

		if accept {
			self.admit(endpoint)
		} else {
			self.reject_connection(endpoint, RejectReason::Rejected)
		}
	}

	/// Send the Welcome frame and assign the client id, but the handshake isn't done yet (§4.6):
	/// the connection stays in `pending` — not `connections` — until `handle_welcome_echo` sees
	/// the client's Welcome echoed back, mirroring `acceptConnection`/`handleWelcomeResponse`'s
	/// split between "sent the welcome" and "the client is actually connected".
	fn admit(&mut self, endpoint: Endpoint) -> ProtoResult<()> {
		let Some(idx) = self.pending.iter().position(|c| c.endpoint() == endpoint) else {
			return Ok(());
		};

		let Some(Reverse(id)) = self.free_ids.pop() else {
			let conn = self.pending.remove(idx);
			self.fail_pending(conn, DisconnectReason::ConnectionRejected);
			return self.send_reject(endpoint, RejectReason::ServerFull);
		};

		let mut conn = self.pending.remove(idx);
		let now = self.peer.now();
		conn.set_id(id);

		let (seq, bytes, retry_delay_ms) = conn.send_welcome(self.peer.pool_mut(), now)?;
		self.peer.send(endpoint, &bytes)?;
		self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: id, seq_id: seq });

		self.pending.push(conn);

		Ok(())
	}

	/// A Welcome frame arrived from an endpoint not yet in `endpoint_to_id`: the client echoing
	/// back the id we assigned it. Only now does the handshake actually complete — id mismatch or
	/// an echo from an endpoint we don't recognise as pending is dropped rather than trusted.
	fn handle_welcome_echo(&mut self, endpoint: Endpoint, mut msg: Message, now: Tick) -> ProtoResult<()> {
		let Some(idx) = self.pending.iter().position(|c| c.endpoint() == endpoint) else {
			return Ok(());
		};

		let echoed_id = msg.buf_mut().get_u16()?;

		if !self.pending[idx].handle_welcome_response(echoed_id, now) {
			return Ok(());
		}

		let conn = self.pending.remove(idx);
		let id = conn.id();

		self.endpoint_to_id.insert(endpoint, id);
		self.connections.insert(id, conn);

		self.client_connected.fire(&ClientConnectedEvent { id });
		self.broadcast_client_connected(id)?;

		Ok(())
	}

	fn broadcast_client_connected(&mut self, new_id: u16) -> ProtoResult<()> {
		let now = self.peer.now();
		let targets: Vec<u16> = self.connections.keys().copied().filter(|&id| id != new_id).collect();

		for id in targets {
			let Some(conn) = self.connections.get_mut(&id) else { continue };
			let (seq, bytes, retry_delay_ms) = conn.send_client_connected(new_id, self.peer.pool_mut(), now)?;
			let endpoint = conn.endpoint();
			self.peer.send(endpoint, &bytes)?;
			self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: id, seq_id: seq });
		}

		Ok(())
	}

	fn broadcast_client_disconnected(&mut self, old_id: u16) -> ProtoResult<()> {
		let now = self.peer.now();
		let targets: Vec<u16> = self.connections.keys().copied().collect();

		for id in targets {
			let Some(conn) = self.connections.get_mut(&id) else { continue };
			let (seq, bytes, retry_delay_ms) = conn.send_client_disconnected(old_id, self.peer.pool_mut(), now)?;
			let endpoint = conn.endpoint();
			self.peer.send(endpoint, &bytes)?;
			self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: id, seq_id: seq });
		}

		Ok(())
	}

	fn local_disconnect(&mut self, id: u16, reason: DisconnectReason) -> ProtoResult<()> {
		let Some(mut conn) = self.connections.remove(&id) else {
			return Ok(());
		};

		let endpoint = conn.endpoint();

		for msg in conn.local_disconnect() {
			self.peer.pool_mut().release(msg);
		}

		self.endpoint_to_id.remove(&endpoint);
		self.free_ids.push(Reverse(id));

		self.client_disconnected.fire(&ClientDisconnectedEvent { id, reason });
		self.broadcast_client_disconnected(id)?;

		Ok(())
	}

	fn fail_pending(&mut self, mut conn: Connection, reason: DisconnectReason) {
		let endpoint = conn.endpoint();
		let id = conn.id();

		for msg in conn.local_disconnect() {
			self.peer.pool_mut().release(msg);
		}

		// A connection can already hold an id by the time it fails — admitted, Welcome sent, but
		// the echo never arrived — in which case the slot has to go back to the free list.
		if id != 0 {
			self.free_ids.push(Reverse(id));
		}

		self.connection_attempt_failed.fire(&ConnectionAttemptFailedEvent { endpoint, reason });
	}

	fn send_reject(&mut self, endpoint: Endpoint, reason: RejectReason) -> ProtoResult<()> {
		let mut msg = self.peer.pool_mut().acquire(HeaderKind::Reject);
		msg.buf_mut().put_u8(reason as u8)?;
		let bytes = msg.as_bytes().to_vec();
		self.peer.pool_mut().release(msg);

		// Sent three times to compensate for unreliable delivery (§4.9): Reject carries no
		// sequencing of its own, so a dropped single copy would otherwise strand the caller.
		for _ in 0..3 {
			self.peer.send(endpoint, &bytes)?;
		}

		Ok(())
	}

	fn handle_control(&mut self, id: u16, mut msg: Message, endpoint: Endpoint, now: Tick) -> ProtoResult<()> {
		match msg.kind() {
			HeaderKind::Ack => {
				let last_received = msg.buf_mut().get_u16()?;
				let bits16 = msg.buf_mut().get_u16()?;
				let explicit = msg.buf_mut().get_bool()?;

				if explicit {
					let _explicit_id = msg.buf_mut().get_u16()?;
				}

				let Some(conn) = self.connections.get_mut(&id) else { return Ok(()) };
				let effects = conn.handle_ack(last_received, bits16, now, self.peer.pool_mut());

				for (seq, bytes, retry_delay_ms) in effects.resends {
					self.peer.send(endpoint, &bytes)?;
					self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: id, seq_id: seq });
				}

				if let Some(reason) = effects.disconnect {
					self.local_disconnect(id, reason)?;
				}
			}
			HeaderKind::Heartbeat => {
				let ping_id = msg.buf_mut().get_u8()?;
				let remote_rtt = msg.buf_mut().get_u16()?;

				let Some(conn) = self.connections.get_mut(&id) else { return Ok(()) };
				let bytes = conn.handle_heartbeat_ping(ping_id, remote_rtt, now);
				self.peer.send(endpoint, &bytes)?;
			}
			HeaderKind::Disconnect => {
				let reason_byte = msg.buf_mut().get_u8()?;
				let _ = DisconnectReason::try_from(reason_byte);
				self.local_disconnect(id, DisconnectReason::Disconnected)?;
			}
			_ => {}
		}

		Ok(())
	}

	/// Rebroadcast a relay-filtered user message's payload to every other client, re-tagged as
	/// Unreliable (§6 glossary "Relay filter").
	fn maybe_relay(&mut self, sender_id: u16, message: &mut Message) -> ProtoResult<()> {
		let Some(filter) = &self.relay_filter else { return Ok(()) };
		let Some(msg_id) = message.msg_id() else { return Ok(()) };

		if !filter.contains(&msg_id) {
			return Ok(());
		}

		let mut relay = self.peer.pool_mut().acquire(HeaderKind::Unreliable);
		relay.set_msg_id(msg_id)?;
		copy_remaining_payload(message.buf_mut(), relay.buf_mut())?;
		let bytes = relay.as_bytes().to_vec();
		self.peer.pool_mut().release(relay);

		let targets: Vec<Endpoint> = self.connections.iter().filter(|(&id, _)| id != sender_id).map(|(_, c)| c.endpoint()).collect();

		for endpoint in targets {
			self.peer.send(endpoint, &bytes)?;
		}

		Ok(())
	}

	fn dispatch_message(&mut self, from: u16, message: Message) {
		let Some(msg_id) = message.msg_id() else { return };

		if let Some(handlers) = self.message_handlers.get_mut(&msg_id) {
			handlers.fire(&ReceivedMessage { from, msg_id, message });
		}
	}
}

fn connection_params(config: &PeerConfig) -> ConnectionParams {
	ConnectionParams {
		timeout_time_ms: config.timeout_time_ms,
		connect_timeout_time_ms: config.connect_timeout_time_ms,
		max_send_attempts: config.max_send_attempts,
		max_avg_send_attempts: config.max_avg_send_attempts,
		avg_send_attempts_resilience: config.avg_send_attempts_resilience,
		max_notify_loss: config.max_notify_loss,
		notify_loss_resilience: config.notify_loss_resilience,
		can_timeout: true,
		can_quality_disconnect: true,
	}
}

/// Copy the unread remainder of `src` (from its current read cursor onward) into `dst`, leaving
/// `src`'s own cursor exactly where it was so a caller can still hand the original message on to
/// its own dispatch after relaying it.
fn copy_remaining_payload(src: &mut BitBuffer, dst: &mut BitBuffer) -> CodecResult<()> {
	let start = src.read_bit();
	let mut remaining = src.write_bit().saturating_sub(start);

	while remaining > 0 {
		let chunk = remaining.min(32) as u32;
		let bits = src.read_bits(chunk)?;
		dst.write_bits(bits, chunk)?;
		remaining -= chunk as usize;
	}

	src.seek_read(start);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::cell::RefCell;
	use std::net::SocketAddr;
	use std::rc::Rc;
	use tidewire_transport::TransportEvent;

	#[derive(Default)]
	struct FakeTransport {
		sent: Rc<RefCell<Vec<(Endpoint, Vec<u8>)>>>,
		inbound: Rc<RefCell<Vec<TransportEvent>>>,
	}

	impl Transport for FakeTransport {
		fn start(&mut self, _port: u16) -> ProtoResult<()> {
			Ok(())
		}

		fn connect(&mut self, _endpoint: Endpoint) -> ProtoResult<()> {
			Ok(())
		}

		fn poll(&mut self) -> Vec<TransportEvent> {
			self.inbound.borrow_mut().drain(..).collect()
		}

		fn send(&mut self, endpoint: Endpoint, bytes: &[u8]) -> ProtoResult<()> {
			self.sent.borrow_mut().push((endpoint, bytes.to_vec()));
			Ok(())
		}

		fn close(&mut self, _endpoint: Endpoint) {}

		fn shutdown(&mut self) {}
	}

	fn client_endpoint(port: u16) -> Endpoint {
		format!("127.0.0.1:{port}").parse::<SocketAddr>().unwrap()
	}

	fn connect_frame() -> Vec<u8> {
		Message::new(HeaderKind::Connect, 0).as_bytes().to_vec()
	}

	/// What a client sends back on receiving Welcome (§4.6) — the completion half of the
	/// handshake the tests below have to simulate since there's no real `Client` in these tests.
	fn welcome_echo_frame(id: u16) -> Vec<u8> {
		let mut msg = Message::new(HeaderKind::Welcome, 8);
		msg.set_seq_id(1).unwrap();
		msg.buf_mut().put_u16(id).unwrap();
		msg.as_bytes().to_vec()
	}

	#[test]
	fn first_client_is_welcomed_with_id_one_and_fires_client_connected() {
		let inbound = Rc::new(RefCell::new(vec![TransportEvent::DataReceived(client_endpoint(1), connect_frame())]));
		let transport = FakeTransport { inbound: inbound.clone(), ..Default::default() };

		let mut server = Server::new(Box::new(transport), PeerConfig::default(), 10);
		server.start(0).unwrap();

		let seen_id = Rc::new(std::cell::Cell::new(0u16));
		let s = seen_id.clone();
		server.client_connected.subscribe(move |e| s.set(e.id));

		server.update().unwrap();
		assert_eq!(seen_id.get(), 0, "welcome sent but not yet echoed — not connected yet");
		assert_eq!(server.client_count(), 0);

		inbound.borrow_mut().push(TransportEvent::DataReceived(client_endpoint(1), welcome_echo_frame(1)));
		server.update().unwrap();

		assert_eq!(seen_id.get(), 1);
		assert_eq!(server.client_count(), 1);
	}

	#[test]
	fn second_connect_past_capacity_is_rejected_three_times_with_server_full() {
		let inbound = Rc::new(RefCell::new(vec![TransportEvent::DataReceived(client_endpoint(1), connect_frame())]));
		let sent = Rc::new(RefCell::new(Vec::new()));
		let transport = FakeTransport { sent: sent.clone(), inbound: inbound.clone() };

		let mut server = Server::new(Box::new(transport), PeerConfig::default(), 1);
		server.start(0).unwrap();
		server.update().unwrap();
		sent.borrow_mut().clear();

		inbound.borrow_mut().push(TransportEvent::DataReceived(client_endpoint(2), connect_frame()));
		server.update().unwrap();

		let rejects: Vec<_> = sent.borrow().iter().filter(|(endpoint, _)| *endpoint == client_endpoint(2)).cloned().collect();
		assert_eq!(rejects.len(), 3);

		let mut reject = Message::new(HeaderKind::Reject, 8);
		reject.load(&rejects[0].1).unwrap();
		reject.parse_header().unwrap();
		assert_eq!(reject.buf_mut().get_u8().unwrap(), RejectReason::ServerFull as u8);
	}

	#[test]
	fn registered_handler_receives_a_reliable_message_from_a_connected_client() {
		let inbound = Rc::new(RefCell::new(vec![TransportEvent::DataReceived(client_endpoint(1), connect_frame())]));
		let transport = FakeTransport { inbound: inbound.clone(), ..Default::default() };

		let mut server = Server::new(Box::new(transport), PeerConfig::default(), 10);
		server.start(0).unwrap();
		server.update().unwrap();

		inbound.borrow_mut().push(TransportEvent::DataReceived(client_endpoint(1), welcome_echo_frame(1)));
		server.update().unwrap();

		let received = Rc::new(RefCell::new(None));
		let r = received.clone();
		server.on_message(42, move |msg| {
			*r.borrow_mut() = Some(msg.from);
		});

		let mut reliable = Message::new(HeaderKind::Reliable, 32);
		reliable.set_seq_id(1).unwrap();
		reliable.set_msg_id(42).unwrap();
		reliable.buf_mut().put_string("Hello World !").unwrap();
		inbound.borrow_mut().push(TransportEvent::DataReceived(client_endpoint(1), reliable.as_bytes().to_vec()));
		server.update().unwrap();

		assert_eq!(*received.borrow(), Some(1));
	}

	#[test]
	fn disconnecting_a_client_returns_its_id_to_the_freelist() {
		let inbound = Rc::new(RefCell::new(vec![TransportEvent::DataReceived(client_endpoint(1), connect_frame())]));
		let transport = FakeTransport { inbound: inbound.clone(), ..Default::default() };

		let mut server = Server::new(Box::new(transport), PeerConfig::default(), 10);
		server.start(0).unwrap();
		server.update().unwrap();

		inbound.borrow_mut().push(TransportEvent::DataReceived(client_endpoint(1), welcome_echo_frame(1)));
		server.update().unwrap();
		assert_eq!(server.client_count(), 1);

		server.disconnect_client(1, DisconnectReason::Disconnected, None).unwrap();
		assert_eq!(server.client_count(), 0);

		inbound.borrow_mut().push(TransportEvent::DataReceived(client_endpoint(2), connect_frame()));
		server.update().unwrap();
		assert_eq!(server.client_ids().collect::<Vec<_>>(), vec![1]);
	}
}
