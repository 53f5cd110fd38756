//! The event surface both transport adapters emit (§6 UDP/TCP transport contract).

use std::net::SocketAddr;

use tidewire_utils::wire::DisconnectReason;

/// Transports are addressed purely by the remote socket address; the library layers
/// its own numeric connection ids on top of this (§3 `Connection`).
pub type Endpoint = SocketAddr;

#[derive(Debug, Clone)]
pub enum TransportEvent {
	Connected(Endpoint),
	DataReceived(Endpoint, Vec<u8>),
	Disconnected(Endpoint, DisconnectReason),
}
