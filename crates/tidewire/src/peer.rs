//! The cooperative, single-threaded event loop shared by [`Client`](crate::client::Client) and
//! [`Server`](crate::server::Server) (§4.7, §5).
//!
//! `Peer` owns the clock, the scheduler, the message pool, and a transport trait object; it knows
//! nothing about connection ids, accept lists, or handshakes — that orchestration lives one layer
//! up. Every tick is: advance the clock, drain due events into a caller-supplied closure, poll the
//! transport, classify each received frame, and hand the classification back to the caller. This
//! mirrors the teacher's `Interface`/`Peer` split (`wireguard::tunnel::Interface` owns the socket
//! and keys, `wireguard::tunnel::Peer` owns per-association state) by keeping the transport-facing
//! plumbing here and the protocol-specific state machine in `Connection`.

use log::{trace, warn};
use tidewire_collections::Pool;
use tidewire_runtime::{Clock, EventPayload, Scheduler, Tick};
use tidewire_transport::{Endpoint, Transport, TransportEvent};
use tidewire_utils::error::ProtoResult;

use crate::config::PeerConfig;
use crate::framing::{classify, ClassifiedFrame};

/// One received frame, already classified, still carrying the endpoint it arrived from (§4.7
/// `handle_data`). The orchestrator looks up or creates the matching `Connection` from `endpoint`.
pub struct InboundFrame {
	pub endpoint: Endpoint,
	pub frame: ClassifiedFrame,
}

/// Everything one `update()` tick produced, for the orchestrator to act on in order (§5: events
/// fire before polled data is dispatched).
pub struct UpdateResult {
	pub now: Tick,
	pub due: Vec<EventPayload>,
	pub connected: Vec<Endpoint>,
	pub disconnected: Vec<(Endpoint, tidewire_utils::wire::DisconnectReason)>,
	pub inbound: Vec<InboundFrame>,
}

pub struct Peer {
	clock: Clock,
	scheduler: Scheduler,
	pool: Pool,
	transport: Box<dyn Transport>,
	config: PeerConfig,
	running: bool,
}

impl Peer {
	pub fn new(transport: Box<dyn Transport>, config: PeerConfig) -> Self {
		Self {
			clock: Clock::new(),
			scheduler: Scheduler::new(),
			pool: Pool::new(config.pool_size),
			transport,
			config,
			running: false,
		}
	}

	#[inline]
	pub fn config(&self) -> &PeerConfig {
		&self.config
	}

	#[inline]
	pub fn pool_mut(&mut self) -> &mut Pool {
		&mut self.pool
	}

	#[inline]
	pub fn now(&self) -> Tick {
		self.clock.now()
	}

	#[inline]
	pub fn is_running(&self) -> bool {
		self.running
	}

	/// Start the clock and bind the transport on `port` (§4.7).
	pub fn start(&mut self, port: u16) -> ProtoResult<()> {
		self.transport.start(port)?;
		self.clock.start();
		self.running = true;
		tidewire_collections::active_peers::enter();
		self.execute_later(0, EventPayload::HeartbeatTick);
		Ok(())
	}

	/// Release the transport and stop the clock; the caller is responsible for tearing down any
	/// connections it still holds before calling this (§4.9 "Server heartbeat").
	pub fn shutdown(&mut self) {
		if !self.running {
			return;
		}

		self.transport.shutdown();
		self.running = false;
		tidewire_collections::active_peers::leave();
	}

	pub fn connect(&mut self, endpoint: Endpoint) -> ProtoResult<()> {
		self.transport.connect(endpoint)
	}

	pub fn close(&mut self, endpoint: Endpoint) {
		self.transport.close(endpoint);
	}

	pub fn send(&mut self, endpoint: Endpoint, bytes: &[u8]) -> ProtoResult<()> {
		self.transport.send(endpoint, bytes)
	}

	/// Schedule `payload` to fire `delay_ms` from now (§4.7 `execute_later`).
	pub fn execute_later(&mut self, delay_ms: u64, payload: EventPayload) {
		self.scheduler.execute_later(self.clock.now(), delay_ms, payload);
	}

	/// One non-reentrant tick (§4.7, §5): advance the clock, drain due events, poll the transport,
	/// classify every received frame. Ordering is events-first, then poll, per §9's resolved
	/// ambiguity between the two generations of the source.
	pub fn update(&mut self) -> UpdateResult {
		let now = self.clock.advance();
		let due = self.scheduler.drain_due(now);

		let mut connected = Vec::new();
		let mut disconnected = Vec::new();
		let mut inbound = Vec::new();

		for event in self.transport.poll() {
			match event {
				TransportEvent::Connected(endpoint) => connected.push(endpoint),
				TransportEvent::Disconnected(endpoint, reason) => disconnected.push((endpoint, reason)),
				TransportEvent::DataReceived(endpoint, bytes) => {
					let frame = classify(&bytes, self.config.max_payload_bytes);

					if matches!(frame, ClassifiedFrame::Malformed) {
						trace!("dropped malformed frame from {endpoint} ({} bytes)", bytes.len());
						continue;
					}

					inbound.push(InboundFrame { endpoint, frame });
				}
			}
		}

		UpdateResult { now, due, connected, disconnected, inbound }
	}

	/// Change the max payload size, refusing while any peer in the process is running (§4.2:
	/// mutable only when no current clients or servers are active).
	pub fn set_max_payload_bytes(&mut self, bytes: usize) {
		if tidewire_collections::active_peers::any_active() {
			warn!("ignored max payload change to {bytes} bytes while a peer is active");
			return;
		}

		self.config.max_payload_bytes = bytes;
		self.pool.set_max_payload_bytes(bytes);
	}
}
