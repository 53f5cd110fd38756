//! The TCP stream adapter (§6 "TCP transport contract").
//!
//! Each logical message is preceded on the wire by a 4-byte little-endian
//! length prefix so a stream of bytes can be split back into the frames the
//! rest of the library works with. One `TcpStream` per endpoint, each with
//! its own partial-read buffer; a listener accepts inbound connections when
//! running as a server.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use log::{debug, warn};
use tidewire_utils::error::{ProtoError, ProtoResult};
use tidewire_utils::wire::DisconnectReason;

use crate::event::{Endpoint, TransportEvent};
use crate::socket_opts;
use crate::Transport;

const LENGTH_PREFIX_BYTES: usize = 4;

struct PeerStream {
	stream: TcpStream,
	inbound: Vec<u8>,
}

pub struct TcpTransport {
	listener: Option<TcpListener>,
	peers: HashMap<Endpoint, PeerStream>,
	max_message_bytes: usize,
}

impl TcpTransport {
	pub fn new(max_message_bytes: usize) -> Self {
		Self {
			listener: None,
			peers: HashMap::new(),
			max_message_bytes,
		}
	}

	fn adopt(&mut self, endpoint: Endpoint, stream: TcpStream) -> ProtoResult<()> {
		stream.set_nonblocking(true).map_err(|e| ProtoError::Transport(e.to_string()))?;

		if let Err(e) = socket_opts::set_recv_buffer_size(&stream, socket_opts::DEFAULT_SOCKET_BUFFER_BYTES) {
			warn!("failed to raise TCP receive buffer: {e}");
		}

		if let Err(e) = socket_opts::set_send_buffer_size(&stream, socket_opts::DEFAULT_SOCKET_BUFFER_BYTES) {
			warn!("failed to raise TCP send buffer: {e}");
		}

		self.peers.insert(endpoint, PeerStream { stream, inbound: Vec::new() });

		Ok(())
	}

	/// Pull whatever bytes are ready off one peer's stream and split complete frames out of its
	/// accumulated buffer, returning the frames and whether the stream closed.
	fn pump(&mut self, endpoint: Endpoint) -> (Vec<Vec<u8>>, bool) {
		let mut chunk = [0u8; 4096];
		let mut frames = Vec::new();
		let mut closed = false;

		let Some(peer) = self.peers.get_mut(&endpoint) else {
			return (frames, closed);
		};

		loop {
			match peer.stream.read(&mut chunk) {
				Ok(0) => {
					closed = true;
					break;
				}
				Ok(n) => peer.inbound.extend_from_slice(&chunk[..n]),
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(e) => {
					debug!("tcp recv error from {endpoint}: {e}");
					closed = true;
					break;
				}
			}
		}

		loop {
			if peer.inbound.len() < LENGTH_PREFIX_BYTES {
				break;
			}

			let len = u32::from_le_bytes(peer.inbound[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;

			if len > self.max_message_bytes {
				warn!("tcp frame from {endpoint} declares {len} bytes, exceeding the configured max; dropping stream");
				closed = true;
				break;
			}

			if peer.inbound.len() < LENGTH_PREFIX_BYTES + len {
				break;
			}

			let frame = peer.inbound[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + len].to_vec();
			peer.inbound.drain(..LENGTH_PREFIX_BYTES + len);
			frames.push(frame);
		}

		(frames, closed)
	}
}

impl Transport for TcpTransport {
	fn start(&mut self, port: u16) -> ProtoResult<()> {
		let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| ProtoError::Transport(e.to_string()))?;
		listener.set_nonblocking(true).map_err(|e| ProtoError::Transport(e.to_string()))?;
		self.listener = Some(listener);
		Ok(())
	}

	fn connect(&mut self, endpoint: Endpoint) -> ProtoResult<()> {
		let stream = TcpStream::connect(endpoint).map_err(|e| ProtoError::Transport(e.to_string()))?;
		self.adopt(endpoint, stream)
	}

	fn poll(&mut self) -> Vec<TransportEvent> {
		let mut events = Vec::new();

		if let Some(listener) = &self.listener {
			loop {
				match listener.accept() {
					Ok((stream, addr)) => {
						if let Err(e) = self.adopt(addr, stream) {
							warn!("failed to adopt inbound tcp connection from {addr}: {e}");
							continue;
						}

						events.push(TransportEvent::Connected(addr));
					}
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
					Err(e) => {
						debug!("tcp accept error: {e}");
						break;
					}
				}
			}
		}

		let endpoints: Vec<Endpoint> = self.peers.keys().copied().collect();

		for endpoint in endpoints {
			let (frames, closed) = self.pump(endpoint);

			for frame in frames {
				events.push(TransportEvent::DataReceived(endpoint, frame));
			}

			if closed {
				self.peers.remove(&endpoint);
				events.push(TransportEvent::Disconnected(endpoint, DisconnectReason::TransportError));
			}
		}

		events
	}

	fn send(&mut self, endpoint: Endpoint, bytes: &[u8]) -> ProtoResult<()> {
		if bytes.len() > self.max_message_bytes {
			return Err(ProtoError::Transport(format!("message of {} bytes exceeds configured max {}", bytes.len(), self.max_message_bytes)));
		}

		let peer = self.peers.get_mut(&endpoint).ok_or_else(|| ProtoError::Transport(format!("no tcp stream for {endpoint}")))?;

		let len = (bytes.len() as u32).to_le_bytes();
		peer.stream.write_all(&len).map_err(|e| ProtoError::Transport(e.to_string()))?;
		peer.stream.write_all(bytes).map_err(|e| ProtoError::Transport(e.to_string()))?;

		Ok(())
	}

	fn close(&mut self, endpoint: Endpoint) {
		self.peers.remove(&endpoint);
	}

	fn shutdown(&mut self) {
		self.peers.clear();
		self.listener = None;
	}
}
