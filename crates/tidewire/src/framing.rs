//! Header-kind classification of a raw received frame (§4.3, §4.7).
//!
//! `Message::parse_header` (in `tidewire-collections`) already knows how to decode the 4-bit tag
//! and its per-kind extension; this module is the thin layer above it that the Peer's receive
//! path (§4.7 `handle_data`) and the Client/Server dispatch tables (§4.8, §4.9) share: it enforces
//! the minimum frame sizes, classifies a frame as a user message to queue or a control frame to
//! interpret immediately, and silently drops anything malformed per §7 ("protocol violations ...
//! never tear down the connection").

use tidewire_collections::Message;
use tidewire_utils::wire::HeaderKind;

/// Minimum bytes for a Notify frame: the 4-bit tag plus the 40-bit notify field (44 bits, §4.3).
pub const MIN_NOTIFY_BYTES: usize = 6;
/// Minimum bytes for any Reliable-class frame: the 4-bit tag plus the 16-bit sequence id (20 bits, §4.3).
pub const MIN_RELIABLE_BYTES: usize = 3;

/// The result of classifying one received frame.
#[derive(Debug)]
pub enum ClassifiedFrame {
	/// A parsed Notify-mode user message; the connection still needs to run it through
	/// `process_notify` before the caller decides whether to queue it for dispatch.
	Notify(Message),
	/// A parsed Unreliable-mode user message, always queued for dispatch (no sequencing).
	UnreliableUser(Message),
	/// A parsed Reliable-mode user message; the caller still needs `Connection::should_handle`.
	ReliableUser(Message),
	/// A parsed control-plane frame (Ack, Connect, Reject, Heartbeat, Disconnect, Welcome,
	/// ClientConnected, ClientDisconnected) for the orchestrator's own dispatch table.
	Control(Message),
	/// Too short, or an unrecognised 4-bit tag; dropped without tearing down the connection (§7).
	Malformed,
}

/// Peek the 4-bit header tag without disturbing `bytes` (no `Message` exists yet at this point).
fn peek_kind(bytes: &[u8]) -> Option<HeaderKind> {
	let tag = *bytes.first()? & 0x0F;
	HeaderKind::try_from(tag).ok()
}

/// Classify a raw received frame, loading it into a freshly built [`Message`] (§4.7 `handle_data`).
///
/// `capacity_bytes` is the connection's configured max payload, used to size the scratch buffer
/// the frame is loaded into (never smaller than the frame itself).
pub fn classify(bytes: &[u8], capacity_bytes: usize) -> ClassifiedFrame {
	let Some(kind) = peek_kind(bytes) else {
		return ClassifiedFrame::Malformed;
	};

	let min_len = match kind {
		HeaderKind::Notify => MIN_NOTIFY_BYTES,
		k if k.is_reliable_class() => MIN_RELIABLE_BYTES,
		_ => 1,
	};

	if bytes.len() < min_len {
		return ClassifiedFrame::Malformed;
	}

	let mut message = Message::new(kind, capacity_bytes.max(bytes.len()));

	if message.load(bytes).and_then(|_| message.parse_header()).is_err() {
		return ClassifiedFrame::Malformed;
	}

	match kind {
		HeaderKind::Notify => ClassifiedFrame::Notify(message),
		HeaderKind::Unreliable => ClassifiedFrame::UnreliableUser(message),
		HeaderKind::Reliable => ClassifiedFrame::ReliableUser(message),
		_ => ClassifiedFrame::Control(message),
	}
}

/// Whether decoding `tag` as a [`HeaderKind`] would succeed; used by tests and by log sites
/// that want to report a bad tag without building a full `Message`.
pub fn tag_is_known(tag: u8) -> bool {
	HeaderKind::try_from(tag & 0x0F).is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn under_minimum_reliable_frame_is_malformed() {
		let frame = classify(&[HeaderKind::Reliable as u8], 64);
		assert!(matches!(frame, ClassifiedFrame::Malformed));
	}

	#[test]
	fn under_minimum_notify_frame_is_malformed() {
		let frame = classify(&[HeaderKind::Notify as u8, 0, 0], 64);
		assert!(matches!(frame, ClassifiedFrame::Malformed));
	}

	#[test]
	fn unknown_tag_is_malformed() {
		let frame = classify(&[0b1111], 64);
		assert!(matches!(frame, ClassifiedFrame::Malformed));
	}

	#[test]
	fn empty_frame_is_malformed() {
		assert!(matches!(classify(&[], 64), ClassifiedFrame::Malformed));
	}

	#[test]
	fn well_formed_unreliable_user_message_classifies_correctly() {
		let mut msg = Message::new(HeaderKind::Unreliable, 64);
		msg.set_msg_id(7).unwrap();
		msg.buf_mut().put_u8(9).unwrap();
		let bytes = msg.as_bytes().to_vec();

		let frame = classify(&bytes, 64);
		assert!(matches!(frame, ClassifiedFrame::UnreliableUser(_)));
	}

	#[test]
	fn control_frames_classify_as_control() {
		let msg = Message::new(HeaderKind::Heartbeat, 64);
		let bytes = msg.as_bytes().to_vec();
		assert!(matches!(classify(&bytes, 64), ClassifiedFrame::Control(_)));

		let mut msg = Message::new(HeaderKind::Welcome, 64);
		msg.set_seq_id(0).unwrap();
		let bytes = msg.as_bytes().to_vec();
		assert!(matches!(classify(&bytes, 64), ClassifiedFrame::Control(_)));
	}
}
