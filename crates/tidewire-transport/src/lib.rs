pub mod event;
pub mod socket_opts;
pub mod tcp;
pub mod udp;

pub use event::{Endpoint, TransportEvent};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use tidewire_utils::error::ProtoResult;

/// The contract a datagram or stream adapter presents to the Peer (§6).
///
/// `tidewire` itself never constructs sockets directly; it drives whatever
/// implements this trait through `poll` once per `update` tick.
pub trait Transport {
	/// Bind a listening/receiving endpoint on `port` (0 picks an ephemeral port for clients).
	fn start(&mut self, port: u16) -> ProtoResult<()>;

	/// Client-side: begin establishing a path to `endpoint` (a no-op for connectionless UDP
	/// beyond remembering the peer; for TCP this opens the stream).
	fn connect(&mut self, endpoint: Endpoint) -> ProtoResult<()>;

	/// Drain everything the transport has observed since the last call.
	fn poll(&mut self) -> Vec<TransportEvent>;

	/// Hand `bytes` to the transport for delivery to `endpoint`.
	fn send(&mut self, endpoint: Endpoint, bytes: &[u8]) -> ProtoResult<()>;

	/// Tear down any per-endpoint state; no further sends to `endpoint` are attempted.
	fn close(&mut self, endpoint: Endpoint);

	/// Release the bound socket(s). The transport is not reused after this.
	fn shutdown(&mut self);
}
