//! The Client orchestrator: connect-retry, the welcome handshake, and the receive dispatch table
//! that turns classified frames into either connection-level bookkeeping or user-facing events
//! (§4.8).
//!
//! A `Client` holds at most one [`Connection`] at a time — the one to the server it is currently
//! talking to (or trying to). Everything else is what [`Peer`] already gives it: the clock,
//! scheduler, pool, and transport.

use std::collections::HashMap;

use tidewire_collections::message::BitBuffer;
use tidewire_collections::Message;
use tidewire_runtime::{EventPayload, Tick};
use tidewire_transport::{Endpoint, Transport};
use tidewire_utils::error::{CodecResult, ProtoError, ProtoResult};
use tidewire_utils::wire::{ConnectionState, DisconnectReason, HeaderKind, RejectReason};

use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionParams, PendingRetryEffect};
use crate::events::{EventList, SubscriptionId};
use crate::framing::ClassifiedFrame;
use crate::peer::{InboundFrame, Peer};

#[derive(Debug, Clone, Copy)]
pub struct ConnectedEvent;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionFailedEvent {
	pub reason: DisconnectReason,
	pub reject_reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct DisconnectedEvent {
	pub reason: DisconnectReason,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientConnectedEvent {
	pub id: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientDisconnectedEvent {
	pub id: u16,
}

/// A dispatched user message, still carrying its own read cursor positioned right after the
/// header and message id so a handler can read its payload directly (§4.7 dispatch FIFO).
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
	pub msg_id: u64,
	pub message: Message,
}

pub struct Client {
	peer: Peer,
	connection: Option<Connection>,
	server_endpoint: Option<Endpoint>,
	id: u16,
	connection_attempts: u32,
	max_connection_attempts: u32,

	pub connected: EventList<ConnectedEvent>,
	pub connection_failed: EventList<ConnectionFailedEvent>,
	pub disconnected: EventList<DisconnectedEvent>,
	pub client_connected: EventList<ClientConnectedEvent>,
	pub client_disconnected: EventList<ClientDisconnectedEvent>,
	message_handlers: HashMap<u64, EventList<ReceivedMessage>>,
}

impl Client {
	pub fn new(transport: Box<dyn Transport>, config: PeerConfig) -> Self {
		Self {
			peer: Peer::new(transport, config),
			connection: None,
			server_endpoint: None,
			id: 0,
			connection_attempts: 0,
			max_connection_attempts: config.max_connection_attempts,
			connected: EventList::new(),
			connection_failed: EventList::new(),
			disconnected: EventList::new(),
			client_connected: EventList::new(),
			client_disconnected: EventList::new(),
			message_handlers: HashMap::new(),
		}
	}

	#[inline]
	pub fn id(&self) -> u16 {
		self.id
	}

	#[inline]
	pub fn state(&self) -> ConnectionState {
		self.connection.as_ref().map(Connection::state).unwrap_or(ConnectionState::NotConnected)
	}

	#[inline]
	pub fn rtt_ms(&self) -> Option<u64> {
		self.connection.as_ref().and_then(Connection::rtt_ms)
	}

	/// Register a handler for every message sent with this `msg_id`, in the teacher's `EventList`
	/// style rather than a single-slot callback (§9 "Event handler lists").
	pub fn on_message(&mut self, msg_id: u64, handler: impl FnMut(&ReceivedMessage) + Send + 'static) -> SubscriptionId {
		self.message_handlers.entry(msg_id).or_default().subscribe(handler)
	}

	/// Begin connecting to `endpoint`, with up to `max_attempts` Connect retries (§4.8).
	pub fn connect(&mut self, endpoint: Endpoint, max_attempts: u32, payload: Option<&[u8]>) -> ProtoResult<()> {
		if !self.peer.is_running() {
			self.peer.start(0)?;
		}

		self.peer.connect(endpoint)?;

		let now = self.peer.now();
		let config = *self.peer.config();

		self.connection = Some(Connection::new(endpoint, now, connection_params(&config)));
		self.server_endpoint = Some(endpoint);
		self.connection_attempts = 0;
		self.max_connection_attempts = max_attempts;
		self.id = 0;

		self.send_connect(endpoint, payload)
	}

	fn send_connect(&mut self, endpoint: Endpoint, payload: Option<&[u8]>) -> ProtoResult<()> {
		let mut msg = self.peer.pool_mut().acquire(HeaderKind::Connect);

		if let Some(payload) = payload {
			for &b in payload {
				msg.buf_mut().put_u8(b)?;
			}
		}

		let bytes = msg.as_bytes().to_vec();
		self.peer.pool_mut().release(msg);
		self.peer.send(endpoint, &bytes)
	}

	pub fn send_unreliable(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>) -> ProtoResult<()> {
		let (endpoint, bytes) = {
			let endpoint = self.require_endpoint()?;
			let conn = self.connection.as_mut().expect("require_endpoint guarantees a connection exists");
			(endpoint, conn.send_unreliable(msg_id, write_payload, self.peer.pool_mut())?)
		};
		self.peer.send(endpoint, &bytes)
	}

	pub fn send_notify(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>) -> ProtoResult<()> {
		let (endpoint, bytes) = {
			let endpoint = self.require_endpoint()?;
			let conn = self.connection.as_mut().expect("require_endpoint guarantees a connection exists");
			(endpoint, conn.send_notify(msg_id, write_payload, self.peer.pool_mut())?)
		};
		self.peer.send(endpoint, &bytes)
	}

	pub fn send_reliable(&mut self, msg_id: u64, write_payload: impl FnOnce(&mut BitBuffer) -> CodecResult<()>) -> ProtoResult<()> {
		let endpoint = self.require_endpoint()?;
		let now = self.peer.now();
		let client_id = self.id;

		let (seq, bytes, retry_delay_ms) = {
			let conn = self.connection.as_mut().expect("require_endpoint guarantees a connection exists");
			conn.send_reliable(msg_id, write_payload, self.peer.pool_mut(), now)?
		};

		self.peer.send(endpoint, &bytes)?;
		self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: client_id, seq_id: seq });
		Ok(())
	}

	fn require_endpoint(&self) -> ProtoResult<Endpoint> {
		self.server_endpoint.ok_or_else(|| ProtoError::ProtocolViolation("not connected".into()))
	}

	/// User-initiated disconnect: tell the server, then tear down locally (§4.8).
	pub fn disconnect(&mut self, payload: Option<&[u8]>) -> ProtoResult<()> {
		if let Some(endpoint) = self.server_endpoint {
			let bytes = Connection::build_disconnect(DisconnectReason::Disconnected, payload, self.peer.pool_mut())?;
			self.peer.send(endpoint, &bytes)?;
		}

		self.local_disconnect(DisconnectReason::Disconnected);
		Ok(())
	}

	fn local_disconnect(&mut self, reason: DisconnectReason) {
		if let Some(mut conn) = self.connection.take() {
			for msg in conn.local_disconnect() {
				self.peer.pool_mut().release(msg);
			}
		}

		self.server_endpoint = None;
		self.disconnected.fire(&DisconnectedEvent { reason });
	}

	fn fail_connect(&mut self, reason: DisconnectReason, reject_reason: Option<RejectReason>) {
		if let Some(mut conn) = self.connection.take() {
			for msg in conn.local_disconnect() {
				self.peer.pool_mut().release(msg);
			}
		}

		self.server_endpoint = None;
		self.connection_failed.fire(&ConnectionFailedEvent { reason, reject_reason });
	}

	/// One tick of the client's loop: drains due events, polls the transport, and dispatches
	/// whatever arrived (§4.7, §5).
	pub fn update(&mut self) -> ProtoResult<()> {
		let tick = self.peer.update();

		for (endpoint, reason) in tick.disconnected {
			if Some(endpoint) == self.server_endpoint {
				self.local_disconnect(reason);
			}
		}

		for event in tick.due {
			match event {
				EventPayload::HeartbeatTick => self.on_heartbeat_tick(tick.now)?,
				EventPayload::PendingMessageRetry { seq_id, .. } => self.on_pending_retry(seq_id, tick.now)?,
			}
		}

		for frame in tick.inbound {
			self.handle_frame(frame)?;
		}

		Ok(())
	}

	fn on_heartbeat_tick(&mut self, now: Tick) -> ProtoResult<()> {
		let heartbeat_interval_ms = self.peer.config().heartbeat_interval_ms;

		if let Some(endpoint) = self.server_endpoint {
			match self.connection.as_ref().map(Connection::state) {
				Some(ConnectionState::Connecting) => {
					self.connection_attempts += 1;

					if self.connection_attempts >= self.max_connection_attempts {
						self.fail_connect(DisconnectReason::NeverConnected, None);
					} else {
						self.send_connect(endpoint, None)?;
					}
				}
				Some(ConnectionState::Pending) => {
					let timed_out = self.connection.as_ref().is_some_and(|c| c.has_connect_attempt_timed_out(now));

					if timed_out {
						self.fail_connect(DisconnectReason::NeverConnected, None);
					}
				}
				Some(ConnectionState::Connected) => {
					let timed_out = self.connection.as_ref().is_some_and(|c| c.has_timed_out(now));

					if timed_out {
						self.local_disconnect(DisconnectReason::TimedOut);
					} else {
						let conn = self.connection.as_mut().expect("checked Connected above");
						let quality_verdict = conn.check_quality();
						let bytes = conn.build_heartbeat_ping(now);
						self.peer.send(endpoint, &bytes)?;

						if let Some(reason) = quality_verdict {
							self.local_disconnect(reason);
						}
					}
				}
				Some(ConnectionState::NotConnected) | None => {}
			}
		}

		self.peer.execute_later(heartbeat_interval_ms, EventPayload::HeartbeatTick);
		Ok(())
	}

	fn on_pending_retry(&mut self, seq_id: u16, now: Tick) -> ProtoResult<()> {
		let Some(conn) = self.connection.as_mut() else {
			return Ok(());
		};

		let endpoint = conn.endpoint();
		let client_id = self.id;
		let effect = conn.retry_pending(seq_id, now, self.peer.pool_mut());

		match effect {
			Some(PendingRetryEffect::Resend { bytes, retry_delay_ms }) => {
				self.peer.send(endpoint, &bytes)?;
				self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: client_id, seq_id });
			}
			Some(PendingRetryEffect::Reschedule { delay_ms }) => {
				self.peer.execute_later(delay_ms, EventPayload::PendingMessageRetry { connection_id: client_id, seq_id });
			}
			Some(PendingRetryEffect::Disconnect(reason)) => self.local_disconnect(reason),
			None => {}
		}

		Ok(())
	}

	fn handle_frame(&mut self, inbound: InboundFrame) -> ProtoResult<()> {
		let InboundFrame { endpoint, frame } = inbound;

		if Some(endpoint) != self.server_endpoint {
			return Ok(());
		}

		let now = self.peer.now();

		match frame {
			ClassifiedFrame::UnreliableUser(msg) => {
				if let Some(conn) = self.connection.as_mut() {
					conn.metrics_mut().received_unreliable(msg.as_bytes().len() as u64);
				}

				self.dispatch_message(msg);
			}
			ClassifiedFrame::ReliableUser(msg) => {
				let seq = msg.seq_id().expect("ReliableUser frames always carry a sequence id");
				let Some(conn) = self.connection.as_mut() else { return Ok(()) };

				let (handled, ack_bytes) = conn.should_handle_reliable(seq, self.peer.pool_mut());
				self.peer.send(endpoint, &ack_bytes)?;

				if handled {
					conn.metrics_mut().received_reliable(msg.as_bytes().len() as u64);
					self.dispatch_message(msg);
				} else {
					conn.metrics_mut().increment_reliable_discarded();
				}
			}
			ClassifiedFrame::Notify(msg) => {
				let Some(conn) = self.connection.as_mut() else { return Ok(()) };
				let outcome = conn.process_notify(&msg);

				if outcome.should_deliver {
					self.dispatch_message(msg);
				}
			}
			ClassifiedFrame::Control(msg) => self.handle_control(msg, endpoint, now)?,
			ClassifiedFrame::Malformed => unreachable!("Peer::update already filters malformed frames"),
		}

		Ok(())
	}

	fn handle_control(&mut self, mut msg: Message, endpoint: Endpoint, now: Tick) -> ProtoResult<()> {
		match msg.kind() {
			HeaderKind::Ack => {
				let last_received = msg.buf_mut().get_u16()?;
				let bits16 = msg.buf_mut().get_u16()?;
				let explicit = msg.buf_mut().get_bool()?;

				if explicit {
					let _explicit_id = msg.buf_mut().get_u16()?;
				}

				let client_id = self.id;
				let Some(conn) = self.connection.as_mut() else { return Ok(()) };
				let effects = conn.handle_ack(last_received, bits16, now, self.peer.pool_mut());

				for (seq, bytes, retry_delay_ms) in effects.resends {
					self.peer.send(endpoint, &bytes)?;
					self.peer.execute_later(retry_delay_ms, EventPayload::PendingMessageRetry { connection_id: client_id, seq_id: seq });
				}

				if let Some(reason) = effects.disconnect {
					self.local_disconnect(reason);
				}
			}
			HeaderKind::Connect => {
				if let Some(conn) = self.connection.as_mut() {
					conn.set_pending(now);
				}
			}
			HeaderKind::Reject => {
				let reason_byte = msg.buf_mut().get_u8()?;
				let reject_reason = RejectReason::try_from(reason_byte).ok();
				self.fail_connect(DisconnectReason::ConnectionRejected, reject_reason);
			}
			HeaderKind::Heartbeat => {
				// The server only ever replies to a ping we sent (§4.8); a reply carries the
				// matching ping id alone, never an rtt sample.
				let ping_id = msg.buf_mut().get_u8()?;

				if let Some(conn) = self.connection.as_mut() {
					conn.handle_heartbeat_response(ping_id, now);
				}
			}
			HeaderKind::Disconnect => {
				let reason_byte = msg.buf_mut().get_u8()?;
				let reason = DisconnectReason::try_from(reason_byte).unwrap_or(DisconnectReason::Disconnected);
				self.local_disconnect(reason);
			}
			HeaderKind::Welcome => {
				let assigned_id = msg.buf_mut().get_u16()?;

				let Some(conn) = self.connection.as_mut() else { return Ok(()) };
				let echo_bytes = conn.handle_welcome(assigned_id, self.peer.pool_mut(), now)?;
				self.id = assigned_id;

				self.peer.send(endpoint, &echo_bytes)?;
				self.connected.fire(&ConnectedEvent);
			}
			HeaderKind::ClientConnected => {
				let id = msg.buf_mut().get_u16()?;
				self.client_connected.fire(&ClientConnectedEvent { id });
			}
			HeaderKind::ClientDisconnected => {
				let id = msg.buf_mut().get_u16()?;
				self.client_disconnected.fire(&ClientDisconnectedEvent { id });
			}
			_ => {}
		}

		Ok(())
	}

	fn dispatch_message(&mut self, message: Message) {
		let Some(msg_id) = message.msg_id() else { return };

		if let Some(handlers) = self.message_handlers.get_mut(&msg_id) {
			handlers.fire(&ReceivedMessage { msg_id, message });
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

	fn server() -> Endpoint {
		"127.0.0.1:7777".parse::<SocketAddr>().unwrap()
	}

	#[test]
	fn connect_sends_a_connect_frame_and_enters_connecting() {
		let sent = Rc::new(RefCell::new(Vec::new()));
		let transport = FakeTransport { sent: sent.clone(), ..Default::default() };

		let mut client = Client::new(Box::new(transport), PeerConfig::default());
		client.connect(server(), 5, None).unwrap();

		assert_eq!(client.state(), ConnectionState::Connecting);
		assert_eq!(sent.borrow().len(), 1);
		assert_eq!(sent.borrow()[0].0, server());
	}

	#[test]
	fn welcome_control_frame_assigns_id_and_fires_connected() {
		let sent = Rc::new(RefCell::new(Vec::new()));
		let inbound = Rc::new(RefCell::new(Vec::new()));
		let transport = FakeTransport { sent: sent.clone(), inbound: inbound.clone() };

		let mut client = Client::new(Box::new(transport), PeerConfig::default());
		client.connect(server(), 5, None).unwrap();

		let connected_count = Rc::new(std::cell::Cell::new(0u32));
		let c = connected_count.clone();
		client.connected.subscribe(move |_| c.set(c.get() + 1));

		let mut welcome = Message::new(HeaderKind::Welcome, 8);
		welcome.set_seq_id(1).unwrap();
		welcome.buf_mut().put_u16(7).unwrap();
		inbound.borrow_mut().push(TransportEvent::DataReceived(server(), welcome.as_bytes().to_vec()));

		client.update().unwrap();

		assert_eq!(client.id(), 7);
		assert_eq!(client.state(), ConnectionState::Connected);
		assert_eq!(connected_count.get(), 1);

		// The handshake isn't one-sided: receiving Welcome also echoes it back to the server,
		// which is what actually completes the server's side of the handshake.
		let echo = sent.borrow().last().cloned().expect("welcome echo sent back");
		let mut echo_msg = Message::new(HeaderKind::Welcome, 8);
		echo_msg.load(&echo.1).unwrap();
		echo_msg.parse_header().unwrap();
		assert_eq!(echo_msg.buf_mut().get_u16().unwrap(), 7);
	}

	#[test]
	fn connect_attempts_exhausted_without_welcome_fires_connection_failed() {
		let transport = FakeTransport::default();
		let mut client = Client::new(Box::new(transport), PeerConfig::default());
		client.connect(server(), 2, None).unwrap();

		let failed = Rc::new(std::cell::Cell::new(false));
		let f = failed.clone();
		client.connection_failed.subscribe(move |e| {
			f.set(true);
			assert_eq!(e.reason, DisconnectReason::NeverConnected);
		});

		for _ in 0..2 {
			client.update().unwrap();
		}

		assert!(failed.get());
		assert_eq!(client.state(), ConnectionState::NotConnected);
	}

	#[test]
	fn message_handler_receives_dispatched_reliable_message() {
		let sent = Rc::new(RefCell::new(Vec::new()));
		let inbound = Rc::new(RefCell::new(Vec::new()));
		let transport = FakeTransport { sent, inbound: inbound.clone() };

		let mut client = Client::new(Box::new(transport), PeerConfig::default());
		client.connect(server(), 5, None).unwrap();

		let mut welcome = Message::new(HeaderKind::Welcome, 8);
		welcome.set_seq_id(1).unwrap();
		welcome.buf_mut().put_u16(1).unwrap();
		inbound.borrow_mut().push(TransportEvent::DataReceived(server(), welcome.as_bytes().to_vec()));
		client.update().unwrap();

		let received = Rc::new(RefCell::new(None));
		let r = received.clone();
		client.on_message(42, move |msg| {
			*r.borrow_mut() = Some(msg.message.buf().clone());
		});

		let mut reliable = Message::new(HeaderKind::Reliable, 32);
		reliable.set_seq_id(1).unwrap();
		reliable.set_msg_id(42).unwrap();
		reliable.buf_mut().put_string("Hello World !").unwrap();
		inbound.borrow_mut().push(TransportEvent::DataReceived(server(), reliable.as_bytes().to_vec()));
		client.update().unwrap();

		assert!(received.borrow().is_some());
	}
}
