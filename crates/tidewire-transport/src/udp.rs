//! The UDP datagram adapter (§6 "UDP transport contract").
//!
//! UDP has no connection handshake of its own; this adapter fires `Connected`
//! the first time it observes a datagram from a socket address it hasn't
//! seen before, and otherwise just shuttles whole datagrams in and out. The
//! connection semantics layered on top (accept/reject/heartbeat) live in
//! `tidewire`, not here.

use std::collections::HashSet;
use std::net::UdpSocket;

use log::{debug, warn};
use tidewire_utils::error::{ProtoError, ProtoResult};

use crate::event::{Endpoint, TransportEvent};
use crate::socket_opts;
use crate::Transport;

pub struct UdpTransport {
	socket: Option<UdpSocket>,
	max_datagram_bytes: usize,
	known_peers: HashSet<Endpoint>,
	recv_buf: Vec<u8>,
}

impl UdpTransport {
	pub fn new(max_datagram_bytes: usize) -> Self {
		Self {
			socket: None,
			max_datagram_bytes,
			known_peers: HashSet::new(),
			recv_buf: vec![0u8; max_datagram_bytes],
		}
	}

	fn socket(&self) -> ProtoResult<&UdpSocket> {
		self.socket.as_ref().ok_or_else(|| ProtoError::Transport("transport not started".into()))
	}
}

impl Transport for UdpTransport {
	fn start(&mut self, port: u16) -> ProtoResult<()> {
		let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|e| ProtoError::Transport(e.to_string()))?;
		socket.set_nonblocking(true).map_err(|e| ProtoError::Transport(e.to_string()))?;

		if let Err(e) = socket_opts::set_recv_buffer_size(&socket, socket_opts::DEFAULT_SOCKET_BUFFER_BYTES) {
			warn!("failed to raise UDP receive buffer: {e}");
		}

		if let Err(e) = socket_opts::set_send_buffer_size(&socket, socket_opts::DEFAULT_SOCKET_BUFFER_BYTES) {
			warn!("failed to raise UDP send buffer: {e}");
		}

		self.socket = Some(socket);

		Ok(())
	}

	fn connect(&mut self, endpoint: Endpoint) -> ProtoResult<()> {
		// Connectionless: nothing to establish, the first send/recv will do the work.
		self.known_peers.insert(endpoint);
		Ok(())
	}

	fn poll(&mut self) -> Vec<TransportEvent> {
		let Some(socket) = self.socket.as_ref() else {
			return Vec::new();
		};

		let mut events = Vec::new();

		loop {
			match socket.recv_from(&mut self.recv_buf) {
				Ok((len, from)) => {
					if self.known_peers.insert(from) {
						events.push(TransportEvent::Connected(from));
					}

					events.push(TransportEvent::DataReceived(from, self.recv_buf[..len].to_vec()));
				}
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(e) => {
					debug!("udp recv error: {e}");
					break;
				}
			}
		}

		events
	}

	fn send(&mut self, endpoint: Endpoint, bytes: &[u8]) -> ProtoResult<()> {
		if bytes.len() > self.max_datagram_bytes {
			return Err(ProtoError::Transport(format!("datagram of {} bytes exceeds configured max {}", bytes.len(), self.max_datagram_bytes)));
		}

		self.socket()?.send_to(bytes, endpoint).map_err(|e| ProtoError::Transport(e.to_string()))?;

		Ok(())
	}

	fn close(&mut self, endpoint: Endpoint) {
		self.known_peers.remove(&endpoint);
	}

	fn shutdown(&mut self) {
		self.known_peers.clear();
		self.socket = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn loopback_round_trip_delivers_one_datagram_and_fires_connected_once() {
		let mut a = UdpTransport::new(1500);
		let mut b = UdpTransport::new(1500);
		a.start(0).unwrap();
		b.start(0).unwrap();

		let a_addr = a.socket.as_ref().unwrap().local_addr().unwrap();
		let b_addr = b.socket.as_ref().unwrap().local_addr().unwrap();

		a.send(b_addr, b"hello").unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));

		let events = b.poll();
		assert!(matches!(events[0], TransportEvent::Connected(addr) if addr == a_addr));
		assert!(matches!(&events[1], TransportEvent::DataReceived(addr, bytes) if *addr == a_addr && bytes == b"hello"));

		// A second datagram from the same peer does not re-fire Connected.
		a.send(b_addr, b"again").unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));
		let events = b.poll();
		assert_eq!(events.len(), 1);
		assert!(matches!(&events[0], TransportEvent::DataReceived(_, bytes) if bytes == b"again"));
	}

	#[test]
	fn oversized_datagram_is_rejected_before_it_reaches_the_socket() {
		let mut a = UdpTransport::new(8);
		a.start(0).unwrap();
		let result = a.send(([127, 0, 0, 1], 1).into(), &[0u8; 16]);
		assert!(result.is_err());
	}
}
