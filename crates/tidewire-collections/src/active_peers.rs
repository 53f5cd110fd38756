//! Process-wide count of running peers, gating whether the max payload size may change (§4.2,
//! §9 "Module-level state").
//!
//! The count is incremented when a [`Peer`](../../tidewire/struct.Peer.html) starts and
//! decremented when it shuts down. `Pool::set_max_payload_bytes` is a no-op (with a logged error,
//! left to the caller) whenever this is nonzero, since in-flight messages sized against the old
//! cap could otherwise exceed the new one. Plain `Ordering::SeqCst` is overkill for a single
//! thread calling `update()`, but the spec calls out multi-threaded hosts explicitly, so this
//! stays atomic rather than a bare `Cell`.

use std::sync::atomic::{AtomicUsize, Ordering};

static ACTIVE_PEERS: AtomicUsize = AtomicUsize::new(0);

/// Call once when a peer transitions into the running state.
pub fn enter() {
	ACTIVE_PEERS.fetch_add(1, Ordering::SeqCst);
}

/// Call once when a peer stops. A double-`leave` without a matching `enter` would underflow;
/// callers are expected to pair this with exactly one prior `enter()` (`Peer::start`/`shutdown`).
pub fn leave() {
	ACTIVE_PEERS.fetch_sub(1, Ordering::SeqCst);
}

/// Whether any peer anywhere in this process is currently running.
pub fn any_active() -> bool {
	ACTIVE_PEERS.load(Ordering::SeqCst) > 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	// The counter is process-wide `static` state, so tests must not run concurrently with it.
	static TEST_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn enter_and_leave_are_balanced() {
		let _guard = TEST_LOCK.lock().unwrap();
		assert!(!any_active());
		enter();
		assert!(any_active());
		enter();
		assert!(any_active());
		leave();
		assert!(any_active());
		leave();
		assert!(!any_active());
	}
}
