//! Wire-level constant tables shared by the codec, the message pool, and the
//! connection state machine (§6 External Interfaces).

use crate::error::CodecError;

/// The 4-bit header tag that begins every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderKind {
	Unreliable = 0,
	Ack = 1,
	Connect = 2,
	Reject = 3,
	Heartbeat = 4,
	Disconnect = 5,
	Notify = 6,
	Reliable = 7,
	Welcome = 8,
	ClientConnected = 9,
	ClientDisconnected = 10,
}

impl HeaderKind {
	/// Whether this kind's extension is "none" (plain 4-bit header, §4.3).
	pub fn is_unreliable_class(self) -> bool {
		matches!(
			self,
			Self::Unreliable | Self::Ack | Self::Connect | Self::Reject | Self::Heartbeat | Self::Disconnect
		)
	}

	/// Whether this kind carries a 16-bit sequence id extension (§4.3).
	pub fn is_reliable_class(self) -> bool {
		matches!(self, Self::Reliable | Self::Welcome | Self::ClientConnected | Self::ClientDisconnected)
	}

	/// Whether this kind is a user-facing message that carries a VarULong message id.
	pub fn is_user_message(self) -> bool {
		matches!(self, Self::Unreliable | Self::Reliable)
	}
}

impl TryFrom<u8> for HeaderKind {
	type Error = CodecError;

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		Ok(match v {
			0 => Self::Unreliable,
			1 => Self::Ack,
			2 => Self::Connect,
			3 => Self::Reject,
			4 => Self::Heartbeat,
			5 => Self::Disconnect,
			6 => Self::Notify,
			7 => Self::Reliable,
			8 => Self::Welcome,
			9 => Self::ClientConnected,
			10 => Self::ClientDisconnected,
			_ => return Err(CodecError::ArgumentOutOfRange(v as i64)),
		})
	}
}

/// A message's delivery discipline, chosen by the sender (§1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SendMode {
	Unreliable = 0,
	Notify = 6,
	Reliable = 7,
}

impl From<SendMode> for HeaderKind {
	fn from(m: SendMode) -> Self {
		match m {
			SendMode::Unreliable => HeaderKind::Unreliable,
			SendMode::Notify => HeaderKind::Notify,
			SendMode::Reliable => HeaderKind::Reliable,
		}
	}
}

/// Why a `Connect` attempt was turned away by a server (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
	NoConnection = 0,
	AlreadyConnected = 1,
	Pending = 2,
	ServerFull = 3,
	Rejected = 4,
	Custom = 5,
}

impl TryFrom<u8> for RejectReason {
	type Error = CodecError;

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		Ok(match v {
			0 => Self::NoConnection,
			1 => Self::AlreadyConnected,
			2 => Self::Pending,
			3 => Self::ServerFull,
			4 => Self::Rejected,
			5 => Self::Custom,
			_ => return Err(CodecError::ArgumentOutOfRange(v as i64)),
		})
	}
}

/// Why a connection was, or is being, torn down (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
	NeverConnected = 0,
	ConnectionRejected = 1,
	TransportError = 2,
	TimedOut = 3,
	Kicked = 4,
	ServerStopped = 5,
	Disconnected = 6,
	PoorConnection = 7,
}

impl TryFrom<u8> for DisconnectReason {
	type Error = CodecError;

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		Ok(match v {
			0 => Self::NeverConnected,
			1 => Self::ConnectionRejected,
			2 => Self::TransportError,
			3 => Self::TimedOut,
			4 => Self::Kicked,
			5 => Self::ServerStopped,
			6 => Self::Disconnected,
			7 => Self::PoorConnection,
			_ => return Err(CodecError::ArgumentOutOfRange(v as i64)),
		})
	}
}

/// Per-peer connection lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
	NotConnected,
	Connecting,
	Pending,
	Connected,
}
