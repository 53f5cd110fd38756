//! A framed, bit-addressable payload plus the header metadata that goes with
//! it (§3 `Message`). Owns a [`BitBuffer`] for the body and tracks which of
//! `msg_id` / `seq_id` / `notify_bits` apply to its `HeaderKind`.

use tidewire_utils::error::CodecResult;
use tidewire_utils::wire::HeaderKind;

use super::bitbuffer::BitBuffer;

/// Default max user payload (§6 Peer configuration), excluding the ≤5-byte header.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1225;
/// Largest possible header: 40-bit notify field rounds up to 5 bytes.
pub const MAX_HEADER_BYTES: usize = 5;

#[derive(Debug, Clone)]
pub struct Message {
	kind: HeaderKind,
	msg_id: Option<u64>,
	seq_id: Option<u16>,
	notify_bits: Option<u64>,
	buf: BitBuffer,
}

impl Message {
	/// Acquire a fresh message with `capacity_bytes` of body room beyond the header.
	pub fn new(kind: HeaderKind, capacity_bytes: usize) -> Self {
		let mut msg = Self {
			kind,
			msg_id: None,
			seq_id: None,
			notify_bits: None,
			buf: BitBuffer::new(capacity_bytes + MAX_HEADER_BYTES),
		};
		msg.write_header();
		msg
	}

	#[inline]
	pub fn kind(&self) -> HeaderKind {
		self.kind
	}

	#[inline]
	pub fn msg_id(&self) -> Option<u64> {
		self.msg_id
	}

	#[inline]
	pub fn seq_id(&self) -> Option<u16> {
		self.seq_id
	}

	#[inline]
	pub fn notify_bits(&self) -> Option<u64> {
		self.notify_bits
	}

	#[inline]
	pub fn buf(&self) -> &BitBuffer {
		&self.buf
	}

	#[inline]
	pub fn buf_mut(&mut self) -> &mut BitBuffer {
		&mut self.buf
	}

	/// Clear the buffer and re-stamp it with a (possibly new) header, as the pool does on acquire.
	pub fn reset(&mut self, kind: HeaderKind) {
		self.kind = kind;
		self.msg_id = None;
		self.seq_id = None;
		self.notify_bits = None;
		self.buf.reset();
		self.write_header();
	}

	fn write_header(&mut self) {
		// 4-bit tag; callers fill in seq_id/notify_bits/msg_id afterwards via the setters below,
		// which also rewrite this prefix so the buffer always reflects the current field values.
		self.buf.write_bits(self.kind as u64, 4).expect("fresh buffer always has header room");
	}

	/// Stamp the 16-bit sequence id for a Reliable-class header (§4.3).
	pub fn set_seq_id(&mut self, seq: u16) -> CodecResult<()> {
		debug_assert!(self.kind.is_reliable_class());
		self.seq_id = Some(seq);
		self.buf.write_bits(seq as u64, 16)
	}

	/// Stamp the 40-bit notify field (§4.3, §4.4 `insert_header`).
	pub fn set_notify_bits(&mut self, last_recv_seq: u16, recv_bitfield_first_8: u8, this_seq: u16) -> CodecResult<()> {
		debug_assert!(self.kind == HeaderKind::Notify);
		let packed = (last_recv_seq as u64) | ((recv_bitfield_first_8 as u64) << 16) | ((this_seq as u64) << 24);
		self.notify_bits = Some(packed);
		self.buf.write_bits(packed, 40)
	}

	/// Stamp the VarULong message id carried by user messages (§4.3).
	pub fn set_msg_id(&mut self, id: u64) -> CodecResult<()> {
		debug_assert!(self.kind.is_user_message());
		self.msg_id = Some(id);
		self.buf.put_varulong(id)
	}

	/// Parse the header back out of a loaded buffer: tag, then the kind-specific extension and
	/// optional message id, leaving the read cursor at the start of the user payload.
	pub fn parse_header(&mut self) -> CodecResult<()> {
		self.buf.seek_read(0);
		let tag = self.buf.read_bits(4)? as u8;
		self.kind = HeaderKind::try_from(tag)?;

		if self.kind.is_reliable_class() {
			self.seq_id = Some(self.buf.read_bits(16)? as u16);
		} else if self.kind == HeaderKind::Notify {
			self.notify_bits = Some(self.buf.read_bits(40)?);
		}

		if self.kind.is_user_message() {
			self.msg_id = Some(self.buf.get_varulong()?);
		}

		Ok(())
	}

	/// Split a parsed 40-bit notify field into `(last_recv_seq, recv_bitfield_first_8, this_seq)`.
	pub fn unpack_notify_bits(packed: u64) -> (u16, u8, u16) {
		((packed & 0xFFFF) as u16, ((packed >> 16) & 0xFF) as u8, ((packed >> 24) & 0xFFFF) as u16)
	}

	/// Serialise to the byte stream the transport sends.
	pub fn as_bytes(&self) -> &[u8] {
		self.buf.as_bytes()
	}

	/// Load a received frame, ready for `parse_header`.
	pub fn load(&mut self, bytes: &[u8]) -> CodecResult<()> {
		self.buf.load(bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unreliable_user_message_round_trips_header_and_payload() {
		let mut msg = Message::new(HeaderKind::Unreliable, 64);
		msg.set_msg_id(42).unwrap();
		msg.buf_mut().put_string("Hello World !").unwrap();

		let bytes = msg.as_bytes().to_vec();

		let mut received = Message::new(HeaderKind::Unreliable, 64);
		received.load(&bytes).unwrap();
		received.parse_header().unwrap();

		assert_eq!(received.kind(), HeaderKind::Unreliable);
		assert_eq!(received.msg_id(), Some(42));
		assert_eq!(received.buf_mut().get_string().unwrap(), "Hello World !");
	}

	#[test]
	fn reliable_message_carries_seq_id() {
		let mut msg = Message::new(HeaderKind::Reliable, 64);
		msg.set_seq_id(7).unwrap();
		msg.set_msg_id(1).unwrap();

		let bytes = msg.as_bytes().to_vec();
		let mut received = Message::new(HeaderKind::Reliable, 64);
		received.load(&bytes).unwrap();
		received.parse_header().unwrap();

		assert_eq!(received.seq_id(), Some(7));
		assert_eq!(received.msg_id(), Some(1));
	}

	#[test]
	fn notify_message_packs_and_unpacks_40_bit_field() {
		let mut msg = Message::new(HeaderKind::Notify, 64);
		msg.set_notify_bits(1000, 0b1010_1010, 1001).unwrap();

		let bytes = msg.as_bytes().to_vec();
		let mut received = Message::new(HeaderKind::Notify, 64);
		received.load(&bytes).unwrap();
		received.parse_header().unwrap();

		let (last_recv, first8, this_seq) = Message::unpack_notify_bits(received.notify_bits().unwrap());
		assert_eq!(last_recv, 1000);
		assert_eq!(first8, 0b1010_1010);
		assert_eq!(this_seq, 1001);
	}

	#[test]
	fn reset_clears_prior_header_fields() {
		let mut msg = Message::new(HeaderKind::Reliable, 64);
		msg.set_seq_id(5).unwrap();
		msg.reset(HeaderKind::Heartbeat);

		assert_eq!(msg.kind(), HeaderKind::Heartbeat);
		assert_eq!(msg.seq_id(), None);
	}
}
